use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info};

use crate::activation::PoolCursor;
use crate::activity::{Activity, ActivityId};
use crate::condition::{Condition, ConditionCode};
use crate::kernel::KernelAccess;
use crate::object::ObjRef;
use crate::value::{TypeTag, ValueDescriptor};

/// Calling-convention revision a package was compiled against. Packages
/// built against a newer revision than the interpreter are rejected.
pub const PACKAGE_API_NO: u32 = 4;

pub const INTERPRETER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutineStyle {
    /// Called as a function from script code.
    Routine,
    /// Called as a method against a receiver, with pool access.
    Method,
}

pub type InvokeFn =
    fn(&mut NativeContext, &mut [ValueDescriptor]) -> Result<(), Condition>;

/// One entry of a package's dispatch table. The signature starts with the
/// return tag and ends with the terminator sentinel.
#[derive(Debug, Clone, Copy)]
pub struct RoutineEntry {
    pub style: RoutineStyle,
    pub name: &'static str,
    /// Guarded entries reserve the receiver's pool before running.
    pub guarded: bool,
    pub signature: &'static [TypeTag],
    pub invoke: InvokeFn,
}

/// A loadable package: identity, API revision, lifecycle hooks, and the
/// dispatch tables.
#[derive(Debug)]
pub struct PackageEntry {
    pub name: &'static str,
    pub version: &'static str,
    pub api_no: u32,
    pub loader: Option<fn()>,
    pub unloader: Option<fn()>,
    pub routines: &'static [RoutineEntry],
    pub methods: &'static [RoutineEntry],
}

impl PackageEntry {
    pub fn find(&self, name: &str) -> Option<&'static RoutineEntry> {
        let routines: &'static [RoutineEntry] = self.routines;
        let methods: &'static [RoutineEntry] = self.methods;
        routines
            .iter()
            .chain(methods.iter())
            .find(|entry| entry.name.eq_ignore_ascii_case(name))
    }
}

/// Registered packages, keyed by case-normalized name.
#[derive(Debug, Default)]
pub struct PackageRegistry {
    packages: HashMap<String, &'static PackageEntry>,
}

impl PackageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        package: &'static PackageEntry,
    ) -> Result<(), Condition> {
        if package.api_no > PACKAGE_API_NO {
            return Err(Condition::new(
                ConditionCode::Failure,
                format!(
                    "package {} requires interface revision {}, \
                     interpreter supports {}",
                    package.name, package.api_no, PACKAGE_API_NO
                ),
            ));
        }
        let key = package.name.to_ascii_lowercase();
        if self.packages.insert(key, package).is_none() {
            if let Some(loader) = package.loader {
                loader();
            }
            info!(
                "registered package {} {} (api {})",
                package.name, package.version, package.api_no
            );
        }
        Ok(())
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        match self.packages.remove(&name.to_ascii_lowercase()) {
            Some(package) => {
                if let Some(unloader) = package.unloader {
                    unloader();
                }
                true
            }
            None => false,
        }
    }

    pub fn get(&self, name: &str) -> Option<&'static PackageEntry> {
        self.packages.get(&name.to_ascii_lowercase()).copied()
    }

    pub fn find_routine(
        &self,
        package: &str,
        routine: &str,
    ) -> Option<&'static RoutineEntry> {
        self.get(package).and_then(|p| p.find(routine))
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

/// How a native-code object locates its target routine.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// Index into the built-in function table.
    Builtin { index: usize },
    /// Routine inside a registered package. The cached entry is a process
    /// address and is dropped when the object is flattened.
    Library {
        package: String,
        routine: String,
        resolved: Option<&'static RoutineEntry>,
    },
}

/// Heap object binding a script-visible name to a native routine.
#[derive(Debug, Clone)]
pub struct NativeCode {
    resolution: Resolution,
}

impl NativeCode {
    pub fn builtin(name: &str) -> Option<Self> {
        builtin_index(name).map(|index| Self {
            resolution: Resolution::Builtin { index },
        })
    }

    pub fn library(package: &str, routine: &str) -> Self {
        Self {
            resolution: Resolution::Library {
                package: package.to_string(),
                routine: routine.to_string(),
                resolved: None,
            },
        }
    }

    pub fn resolution(&self) -> &Resolution {
        &self.resolution
    }

    pub fn is_resolved(&self) -> bool {
        match &self.resolution {
            Resolution::Builtin { .. } => true,
            Resolution::Library { resolved, .. } => resolved.is_some(),
        }
    }

    /// Forget the cached routine address. Run before the object is written
    /// into an image; addresses do not survive the process.
    pub fn drop_resolved(&mut self) {
        if let Resolution::Library { resolved, .. } = &mut self.resolution {
            *resolved = None;
        }
    }

    /// Locate the target routine, caching library lookups.
    pub fn resolve(
        &mut self,
        registry: &PackageRegistry,
    ) -> Result<&'static RoutineEntry, Condition> {
        match &mut self.resolution {
            Resolution::Builtin { index } => Ok(&BUILTINS[*index]),
            Resolution::Library {
                package,
                routine,
                resolved,
            } => {
                if let Some(entry) = resolved {
                    return Ok(entry);
                }
                match registry.find_routine(package, routine) {
                    Some(entry) => {
                        debug!("resolved {package}::{routine}");
                        *resolved = Some(entry);
                        Ok(entry)
                    }
                    None => Err(Condition::new(
                        ConditionCode::RoutineNotFound,
                        format!("routine {routine} not found in package {package}"),
                    )),
                }
            }
        }
    }
}

/// Result of driving a routine stub.
#[derive(Debug)]
pub enum StubOutcome {
    /// Signature query: no arguments were passed, the stub reported its
    /// calling convention instead of running.
    Signature(&'static [TypeTag]),
    Completed,
    Raised(Condition),
}

/// The unified stub protocol: one entry point serves both the describe
/// query and the actual invocation, selected by whether argument slots
/// were supplied.
pub fn stub_call(
    entry: &'static RoutineEntry,
    invocation: Option<(&mut NativeContext, &mut [ValueDescriptor])>,
) -> StubOutcome {
    match invocation {
        None => StubOutcome::Signature(entry.signature),
        Some((context, slots)) => match (entry.invoke)(context, slots) {
            Ok(()) => StubOutcome::Completed,
            Err(condition) => StubOutcome::Raised(condition),
        },
    }
}

/// Services available to a native routine while it runs: variable pool
/// access, guard control, and notification registration. Wake-ups are
/// deferred into `pending_posts` and delivered after the kernel is
/// released, so a woken activity finds the lock free.
pub struct NativeContext<'a, 'k> {
    pub activity: &'a Arc<Activity>,
    access: &'a mut KernelAccess<'k>,
    receiver: Option<ObjRef>,
    object_variables: Option<ObjRef>,
    pool_enabled: bool,
    cursor: Option<PoolCursor>,
    pending_posts: Vec<ActivityId>,
}

impl<'a, 'k> NativeContext<'a, 'k> {
    pub fn new(
        activity: &'a Arc<Activity>,
        access: &'a mut KernelAccess<'k>,
        receiver: Option<ObjRef>,
        object_variables: Option<ObjRef>,
    ) -> Self {
        Self {
            activity,
            access,
            receiver,
            object_variables,
            pool_enabled: object_variables.is_some(),
            cursor: None,
            pending_posts: Vec::new(),
        }
    }

    pub fn receiver(&self) -> Option<ObjRef> {
        self.receiver
    }

    pub fn heap(&mut self) -> &mut crate::heap::Heap {
        &mut self.access.heap
    }

    pub fn digits(&self) -> u32 {
        self.activity.numeric_settings().digits
    }

    pub fn random(&self) -> u64 {
        self.activity.random_next()
    }

    fn pool(&self) -> Result<ObjRef, Condition> {
        if !self.pool_enabled {
            return Err(Condition::new(
                ConditionCode::Failure,
                "variable pool access is disabled in this context",
            ));
        }
        self.object_variables.ok_or_else(|| {
            Condition::new(
                ConditionCode::Failure,
                "no variable pool in this context",
            )
        })
    }

    // variable pool

    pub fn get_variable(
        &mut self,
        name: &str,
    ) -> Result<Option<ValueDescriptor>, Condition> {
        let pool = self.pool()?;
        let value = self
            .access
            .heap
            .variables(pool)
            .and_then(|dict| dict.get(name))
            .and_then(|var| var.value());
        Ok(value.map(|r| ValueDescriptor::from_object(&self.access.heap, r)))
    }

    pub fn set_variable(
        &mut self,
        name: &str,
        value: ValueDescriptor,
    ) -> Result<(), Condition> {
        let pool = self.pool()?;
        let object = value.into_object(&mut self.access.heap);
        let notified = self
            .access
            .heap
            .variables_mut(pool)
            .map(|dict| dict.set(name, object))
            .unwrap_or_default();
        self.defer_posts(notified);
        Ok(())
    }

    pub fn drop_variable(&mut self, name: &str) -> Result<(), Condition> {
        let pool = self.pool()?;
        let notified = self
            .access
            .heap
            .variables_mut(pool)
            .map(|dict| dict.drop_variable(name))
            .unwrap_or_default();
        self.defer_posts(notified);
        Ok(())
    }

    /// Register this activity for a wake-up when the variable changes.
    pub fn request_notification(&mut self, name: &str) -> Result<(), Condition> {
        let pool = self.pool()?;
        let id = self.activity.id;
        if let Some(dict) = self.access.heap.variables_mut(pool) {
            dict.inform(name, id);
        }
        Ok(())
    }

    pub fn cancel_notification(&mut self, name: &str) -> Result<(), Condition> {
        let pool = self.pool()?;
        let id = self.activity.id;
        if let Some(dict) = self.access.heap.variables_mut(pool) {
            dict.uninform(name, id);
        }
        Ok(())
    }

    // guard control, non-blocking and re-entrant

    pub fn guard_on(&mut self) -> Result<(), Condition> {
        let pool = self.pool()?;
        let id = self.activity.id;
        let dict = self
            .access
            .heap
            .variables_mut(pool)
            .expect("pool handle is a variables object");
        dict.try_reserve(id).map_err(|owner| {
            Condition::new(
                ConditionCode::Failure,
                format!("variable pool is reserved by activity {}", owner.0),
            )
        })
    }

    pub fn guard_off(&mut self) -> Result<(), Condition> {
        let pool = self.pool()?;
        let id = self.activity.id;
        let woken = self
            .access
            .heap
            .variables_mut(pool)
            .map(|dict| dict.release(id))
            .unwrap_or_default();
        self.defer_posts(woken);
        Ok(())
    }

    // pool cursor

    pub fn enable_variable_pool(&mut self) {
        self.pool_enabled = self.object_variables.is_some();
    }

    pub fn disable_variable_pool(&mut self) {
        self.pool_enabled = false;
        self.cursor = None;
    }

    /// Step the pool cursor: the next variable name and its value, or
    /// nothing once the snapshot is exhausted.
    pub fn fetch_next(
        &mut self,
    ) -> Result<Option<(String, Option<ValueDescriptor>)>, Condition> {
        let pool = self.pool()?;
        if self.cursor.is_none() {
            let names = self
                .access
                .heap
                .variables(pool)
                .map(|dict| dict.names())
                .unwrap_or_default();
            self.cursor = Some(PoolCursor::new(names));
        }
        let name = match self
            .cursor
            .as_mut()
            .and_then(|cursor| cursor.fetch_next())
        {
            Some(name) => name.to_string(),
            None => return Ok(None),
        };
        let value = self
            .access
            .heap
            .variables(pool)
            .and_then(|dict| dict.get(&name))
            .and_then(|var| var.value())
            .map(|r| ValueDescriptor::from_object(&self.access.heap, r));
        Ok(Some((name, value)))
    }

    pub fn reset_next(&mut self) {
        if let Some(cursor) = self.cursor.as_mut() {
            cursor.reset();
        }
    }

    fn defer_posts(&mut self, ids: Vec<ActivityId>) {
        for id in ids {
            if id != self.activity.id && !self.pending_posts.contains(&id) {
                self.pending_posts.push(id);
            }
        }
    }

    /// Drain the deferred wake-ups; the dispatcher delivers them once the
    /// kernel has been released.
    pub fn take_pending_posts(&mut self) -> Vec<ActivityId> {
        std::mem::take(&mut self.pending_posts)
    }
}

// built-in function table

fn builtin_abs(
    _context: &mut NativeContext,
    slots: &mut [ValueDescriptor],
) -> Result<(), Condition> {
    let v = require_i64(slots, 1)?;
    slots[0] = ValueDescriptor::Int64(v.abs());
    Ok(())
}

fn builtin_sign(
    _context: &mut NativeContext,
    slots: &mut [ValueDescriptor],
) -> Result<(), Condition> {
    let v = require_i64(slots, 1)?;
    slots[0] = ValueDescriptor::Int32(v.signum() as i32);
    Ok(())
}

fn builtin_max(
    _context: &mut NativeContext,
    slots: &mut [ValueDescriptor],
) -> Result<(), Condition> {
    let first = require_i64(slots, 1)?;
    let best = slots[2..]
        .iter()
        .filter_map(ValueDescriptor::as_i64)
        .fold(first, i64::max);
    slots[0] = ValueDescriptor::Int64(best);
    Ok(())
}

fn builtin_min(
    _context: &mut NativeContext,
    slots: &mut [ValueDescriptor],
) -> Result<(), Condition> {
    let first = require_i64(slots, 1)?;
    let best = slots[2..]
        .iter()
        .filter_map(ValueDescriptor::as_i64)
        .fold(first, i64::min);
    slots[0] = ValueDescriptor::Int64(best);
    Ok(())
}

fn builtin_length(
    _context: &mut NativeContext,
    slots: &mut [ValueDescriptor],
) -> Result<(), Condition> {
    let s = slots
        .get(1)
        .and_then(ValueDescriptor::as_str)
        .ok_or_else(|| bad_argument(1))?;
    slots[0] = ValueDescriptor::Uint32(s.chars().count() as u32);
    Ok(())
}

fn builtin_random(
    context: &mut NativeContext,
    slots: &mut [ValueDescriptor],
) -> Result<(), Condition> {
    let max = match slots.get(1) {
        Some(v) if v.is_supplied() => {
            let m = v.as_i64().ok_or_else(|| bad_argument(1))?;
            if m <= 0 {
                return Err(bad_argument(1));
            }
            m
        }
        _ => 999,
    };
    let raw = context.random();
    slots[0] = ValueDescriptor::Int64((raw % (max as u64 + 1)) as i64);
    Ok(())
}

fn require_i64(slots: &[ValueDescriptor], index: usize) -> Result<i64, Condition> {
    slots
        .get(index)
        .and_then(ValueDescriptor::as_i64)
        .ok_or_else(|| bad_argument(index))
}

fn bad_argument(index: usize) -> Condition {
    Condition::new(
        ConditionCode::BadArgument,
        format!("argument {index} is missing or not valid"),
    )
    .with_subcode(index as i32)
}

macro_rules! builtin {
    ($name:literal, $sig:expr, $invoke:path) => {
        RoutineEntry {
            style: RoutineStyle::Routine,
            name: $name,
            guarded: false,
            signature: $sig,
            invoke: $invoke,
        }
    };
}

use TypeTag::{Int32, Int64, String as Str, Terminator, Uint32};

/// Built-in functions, resolvable without a package. Kept sorted by name.
pub const BUILTINS: &[RoutineEntry] = &[
    builtin!("ABS", &[Int64, Int64, Terminator], builtin_abs),
    builtin!("LENGTH", &[Uint32, Str, Terminator], builtin_length),
    builtin!("MAX", &[Int64, Int64, Int64, Int64, Terminator], builtin_max),
    builtin!("MIN", &[Int64, Int64, Int64, Int64, Terminator], builtin_min),
    builtin!("RANDOM", &[Int64, Int64, Terminator], builtin_random),
    builtin!("SIGN", &[Int32, Int64, Terminator], builtin_sign),
];

pub fn builtin_index(name: &str) -> Option<usize> {
    BUILTINS
        .iter()
        .position(|entry| entry.name.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str) -> &'static RoutineEntry {
        &BUILTINS[builtin_index(name).expect("known builtin")]
    }

    #[test]
    fn builtin_lookup_is_case_insensitive() {
        assert!(builtin_index("abs").is_some());
        assert!(builtin_index("Length").is_some());
        assert!(builtin_index("NOSUCH").is_none());
    }

    #[test]
    fn stub_reports_its_signature_without_running() {
        // describe query: no argument slots supplied
        let outcome = stub_call(entry("ABS"), None);
        match outcome {
            StubOutcome::Signature(sig) => {
                assert_eq!(sig, &[Int64, Int64, Terminator]);
            }
            other => panic!("expected a signature, got {other:?}"),
        }
    }

    #[test]
    fn native_code_builtin_resolves_without_a_registry() {
        let registry = PackageRegistry::new();
        let mut code = NativeCode::builtin("SIGN").expect("known builtin");
        assert!(code.is_resolved());
        let entry = code.resolve(&registry).unwrap();
        assert_eq!(entry.name, "SIGN");
    }

    #[test]
    fn unresolvable_library_routine_is_a_condition() {
        let registry = PackageRegistry::new();
        let mut code = NativeCode::library("rxmath", "SQRT");
        assert!(!code.is_resolved());
        let err = code.resolve(&registry).unwrap_err();
        assert_eq!(err.code, ConditionCode::RoutineNotFound);
    }

    #[test]
    fn drop_resolved_clears_only_the_cache() {
        static PKG: PackageEntry = PackageEntry {
            name: "rxtest",
            version: "1.0.0",
            api_no: PACKAGE_API_NO,
            loader: None,
            unloader: None,
            routines: &[builtin!(
                "IDENT",
                &[Int64, Int64, Terminator],
                builtin_abs
            )],
            methods: &[],
        };
        let mut registry = PackageRegistry::new();
        registry.register(&PKG).unwrap();

        let mut code = NativeCode::library("rxtest", "IDENT");
        code.resolve(&registry).unwrap();
        assert!(code.is_resolved());

        code.drop_resolved();
        assert!(!code.is_resolved());
        // the name-based resolution is still intact
        assert!(code.resolve(&registry).is_ok());
    }

    #[test]
    fn registry_rejects_a_newer_api_revision() {
        static FUTURE: PackageEntry = PackageEntry {
            name: "rxfuture",
            version: "9.0.0",
            api_no: PACKAGE_API_NO + 1,
            loader: None,
            unloader: None,
            routines: &[],
            methods: &[],
        };
        let mut registry = PackageRegistry::new();
        let err = registry.register(&FUTURE).unwrap_err();
        assert_eq!(err.code, ConditionCode::Failure);
        assert!(registry.get("rxfuture").is_none());
    }
}
