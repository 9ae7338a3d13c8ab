use std::fmt::Write as _;

/// Script-level condition classes. Fatal interpreter invariant violations
/// are not conditions; those panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConditionCode {
    Syntax,
    Halt,
    NoValue,
    BadArgument,
    RoutineNotFound,
    StackOverflow,
    Deadlock,
    Failure,
    User,
}

impl ConditionCode {
    /// Major return code reported for this condition class.
    pub fn rc(self) -> i32 {
        match self {
            ConditionCode::Syntax => 35,
            ConditionCode::Halt => 4,
            ConditionCode::NoValue => 42,
            ConditionCode::BadArgument => 40,
            ConditionCode::RoutineNotFound => 43,
            ConditionCode::StackOverflow => 11,
            ConditionCode::Deadlock => 91,
            ConditionCode::Failure => 48,
            ConditionCode::User => 93,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            ConditionCode::Syntax => "Incorrect expression",
            ConditionCode::Halt => "Program interrupted",
            ConditionCode::NoValue => "No value",
            ConditionCode::BadArgument => "Incorrect call to routine",
            ConditionCode::RoutineNotFound => "Routine not found",
            ConditionCode::StackOverflow => {
                "Control stack full"
            }
            ConditionCode::Deadlock => {
                "Deadlock detected between waiting activities"
            }
            ConditionCode::Failure => "Failure in system service",
            ConditionCode::User => "User condition raised",
        }
    }
}

/// Structured representation of a recoverable script-level error. Carries
/// enough to either be trapped by a handler frame or rendered as the
/// standard unhandled-condition message block.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub code: ConditionCode,
    pub rc: i32,
    pub subcode: i32,
    pub description: String,
    /// Clause line where the condition was raised.
    pub position: usize,
    pub program: String,
    pub traceback: Vec<String>,
}

impl Condition {
    pub fn new(code: ConditionCode, description: impl Into<String>) -> Self {
        Self {
            code,
            rc: code.rc(),
            subcode: 1,
            description: description.into(),
            position: 0,
            program: "<main>".to_string(),
            traceback: Vec::new(),
        }
    }

    pub fn in_program(mut self, program: &str) -> Self {
        self.program = program.to_string();
        self
    }

    pub fn at_line(mut self, line: usize) -> Self {
        self.position = line;
        self
    }

    pub fn with_subcode(mut self, subcode: i32) -> Self {
        self.subcode = subcode;
        self
    }

    /// The standard unhandled-condition block: traceback lines, the
    /// `Error <rc> running ...` line, then the `Error <rc>.<subcode>` line.
    pub fn display(&self) -> String {
        let mut out = String::new();
        for line in &self.traceback {
            let _ = writeln!(out, "{line}");
        }
        let _ = writeln!(
            out,
            "Error {} running {} line {}: {}",
            self.rc, self.program, self.position, self.description
        );
        let _ = writeln!(
            out,
            "Error {}.{}: {}",
            self.rc,
            self.subcode,
            self.code.message()
        );
        out
    }
}
