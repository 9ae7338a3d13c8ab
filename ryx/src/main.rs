use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::error;

use ryx::{
    Condition, InstanceCreateInfo, InterpreterInstance, NativeCode,
    NativeContext, PACKAGE_API_NO, PackageEntry, RoutineEntry, RoutineStyle,
    TypeTag, ValueDescriptor, save_image,
};

fn add2(
    _context: &mut NativeContext,
    slots: &mut [ValueDescriptor],
) -> Result<(), Condition> {
    let a = slots.get(1).and_then(ValueDescriptor::as_i64).unwrap_or(0);
    let b = slots.get(2).and_then(ValueDescriptor::as_i64).unwrap_or(0);
    slots[0] = ValueDescriptor::Int64(a + b);
    Ok(())
}

static DEMO_PKG: PackageEntry = PackageEntry {
    name: "demo",
    version: env!("CARGO_PKG_VERSION"),
    api_no: PACKAGE_API_NO,
    loader: None,
    unloader: None,
    routines: &[RoutineEntry {
        style: RoutineStyle::Routine,
        name: "ADD2",
        guarded: false,
        signature: &[
            TypeTag::Int64,
            TypeTag::Int64,
            TypeTag::Int64,
            TypeTag::Terminator,
        ],
        invoke: add2,
    }],
    methods: &[],
};

#[derive(Parser, Debug)]
#[command(name = "ryx", version, about = "native routine dispatcher")]
struct Args {
    /// Routine to invoke, a built-in unless --package is given
    routine: String,

    /// Integer arguments passed to the routine
    args: Vec<i64>,

    /// Resolve the routine from a registered package instead
    #[arg(long)]
    package: Option<String>,

    /// Write the result object to an image file
    #[arg(long, value_name = "FILE")]
    save: Option<PathBuf>,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let instance = InterpreterInstance::create(InstanceCreateInfo::default());
    if let Err(condition) = instance.register_package(&DEMO_PKG) {
        eprint!("{}", condition.display());
        return ExitCode::FAILURE;
    }
    let root = instance.root_activity();
    let mut access = instance.enter(&root);

    let code = match &args.package {
        Some(package) => access
            .heap
            .alloc_native_code(NativeCode::library(package, &args.routine)),
        None => match NativeCode::builtin(&args.routine) {
            Some(code) => access.heap.alloc_native_code(code),
            None => {
                error!("no built-in routine named {}", args.routine);
                return ExitCode::FAILURE;
            }
        },
    };

    let values: Vec<ValueDescriptor> =
        args.args.iter().map(|&v| ValueDescriptor::Int64(v)).collect();

    let (mut access, result) = instance.run_native(
        &root,
        access,
        code,
        None,
        None,
        &args.routine,
        &values,
    );

    match result {
        Ok(value) => {
            println!("{}", render(&value));
            if let Some(path) = &args.save {
                let object = value.into_object(&mut access.heap);
                let file = match File::create(path) {
                    Ok(file) => file,
                    Err(err) => {
                        error!("cannot create {}: {err}", path.display());
                        return ExitCode::FAILURE;
                    }
                };
                if let Err(err) =
                    save_image(&mut BufWriter::new(file), &access.heap, object)
                {
                    error!("cannot write {}: {err}", path.display());
                    return ExitCode::FAILURE;
                }
            }
            ExitCode::SUCCESS
        }
        Err(condition) => {
            eprint!("{}", condition.display());
            ExitCode::FAILURE
        }
    }
}

fn render(value: &ValueDescriptor) -> String {
    match value {
        ValueDescriptor::Int32(v) => v.to_string(),
        ValueDescriptor::Uint32(v) => v.to_string(),
        ValueDescriptor::Int64(v) => v.to_string(),
        ValueDescriptor::Double(v) => v.to_string(),
        ValueDescriptor::Boolean(true) => "1".to_string(),
        ValueDescriptor::Boolean(false) => "0".to_string(),
        ValueDescriptor::String(s) => s.clone(),
        ValueDescriptor::Object(r) => format!("<object {}>", r.0),
        ValueDescriptor::Omitted => String::new(),
    }
}
