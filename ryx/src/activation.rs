use crate::condition::ConditionCode;
use crate::object::ObjRef;
use crate::value::ValueDescriptor;

pub const DEFAULT_DIGITS: u32 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumericForm {
    Scientific,
    Engineering,
}

/// Decimal arithmetic context. Copied into a frame on push and restored by
/// the pop, so a callee's `NUMERIC DIGITS` never leaks to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NumericSettings {
    pub digits: u32,
    pub fuzz: u32,
    pub form: NumericForm,
}

impl Default for NumericSettings {
    fn default() -> Self {
        Self {
            digits: DEFAULT_DIGITS,
            fuzz: 0,
            form: NumericForm::Scientific,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Interpreted,
    Native,
}

/// Cursor over a variable pool snapshot. Lazy and finite: once exhausted
/// it keeps returning nothing until `reset` rewinds it.
#[derive(Debug, Clone)]
pub struct PoolCursor {
    names: Vec<String>,
    next: usize,
}

impl PoolCursor {
    pub fn new(names: Vec<String>) -> Self {
        Self { names, next: 0 }
    }

    pub fn fetch_next(&mut self) -> Option<&str> {
        let name = self.names.get(self.next)?;
        self.next += 1;
        Some(name)
    }

    pub fn reset(&mut self) {
        self.next = 0;
    }
}

/// One call frame. Interpreted and native frames share the layout; the
/// guard and traceback machinery treats them uniformly.
#[derive(Debug, Clone)]
pub struct Activation {
    pub kind: FrameKind,
    pub message: String,
    pub receiver: Option<ObjRef>,
    pub settings: NumericSettings,
    /// Object-variable pool in use by this frame, rooted for the collector.
    pub variable_pool: Option<ObjRef>,
    /// Whether this frame holds the pool's guard reservation.
    pub guarded: bool,
    pub traps: Vec<ConditionCode>,
    pub args: Vec<ValueDescriptor>,
    pub line: usize,
}

impl Activation {
    pub fn interpreted(message: &str) -> Self {
        Self {
            kind: FrameKind::Interpreted,
            message: message.to_string(),
            receiver: None,
            settings: NumericSettings::default(),
            variable_pool: None,
            guarded: false,
            traps: Vec::new(),
            args: Vec::new(),
            line: 0,
        }
    }

    pub fn native(
        message: &str,
        receiver: Option<ObjRef>,
        args: Vec<ValueDescriptor>,
    ) -> Self {
        Self {
            kind: FrameKind::Native,
            message: message.to_string(),
            receiver,
            settings: NumericSettings::default(),
            variable_pool: None,
            guarded: false,
            traps: Vec::new(),
            args,
            line: 0,
        }
    }

    pub fn with_trap(mut self, code: ConditionCode) -> Self {
        self.traps.push(code);
        self
    }

    pub fn traps(&self, code: ConditionCode) -> bool {
        self.traps.contains(&code)
    }
}

/// Strict LIFO frame stack of one activity. The sender of a frame is the
/// frame below it; no back-pointers.
#[derive(Debug, Default)]
pub struct ActivationStack {
    frames: Vec<Activation>,
}

impl ActivationStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a frame, inheriting the caller's numeric settings by copy.
    pub fn push(&mut self, mut frame: Activation) -> usize {
        if let Some(top) = self.frames.last() {
            frame.settings = top.settings;
        }
        self.frames.push(frame);
        self.frames.len() - 1
    }

    pub fn pop(&mut self) -> Activation {
        self.frames
            .pop()
            .expect("popped an empty activation stack")
    }

    pub fn current(&self) -> Option<&Activation> {
        self.frames.last()
    }

    pub fn current_mut(&mut self) -> Option<&mut Activation> {
        self.frames.last_mut()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frame(&self, index: usize) -> Option<&Activation> {
        self.frames.get(index)
    }

    pub fn frame_mut(&mut self, index: usize) -> Option<&mut Activation> {
        self.frames.get_mut(index)
    }

    /// The frame that invoked `index`, for tracebacks and introspection.
    pub fn sender(&self, index: usize) -> Option<usize> {
        if index == 0 || index >= self.frames.len() {
            None
        } else {
            Some(index - 1)
        }
    }

    /// Unwind to a prior depth, dropping the popped frames.
    pub fn unwind_to(&mut self, depth: usize) {
        debug_assert!(depth <= self.frames.len());
        self.frames.truncate(depth);
    }

    pub fn frames(&self) -> &[Activation] {
        &self.frames
    }

    /// Traceback lines, most recent frame first.
    pub fn traceback(&self) -> Vec<String> {
        self.frames
            .iter()
            .enumerate()
            .rev()
            .map(|(i, frame)| format!("{:>6} *-* {}", i + 1, frame.message))
            .collect()
    }
}
