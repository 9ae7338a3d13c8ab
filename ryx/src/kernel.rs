use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::activity::ActivityId;
use crate::heap::Heap;
use crate::object::ObjRef;

/// Objects pinned across activities through the external reference API.
/// Entries are reference counted; the table is a GC root.
#[derive(Debug, Default)]
pub struct GlobalReferenceTable {
    refs: HashMap<ObjRef, usize>,
}

impl GlobalReferenceTable {
    pub fn add(&mut self, r: ObjRef) {
        *self.refs.entry(r).or_insert(0) += 1;
    }

    /// Returns false if the reference was not held.
    pub fn remove(&mut self, r: ObjRef) -> bool {
        match self.refs.get_mut(&r) {
            Some(count) => {
                *count -= 1;
                if *count == 0 {
                    self.refs.remove(&r);
                }
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, r: ObjRef) -> bool {
        self.refs.contains_key(&r)
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    pub fn visit(&self, visit: &mut dyn FnMut(ObjRef)) {
        for &r in self.refs.keys() {
            visit(r);
        }
    }
}

/// Everything only touchable while holding kernel access.
#[derive(Debug)]
pub struct KernelState {
    pub heap: Heap,
    pub globals: GlobalReferenceTable,
}

/// The process-wide exclusive-execution lock. At most one activity runs
/// interpreter code at a time; everything else is a hand-off point.
#[derive(Debug)]
pub struct Kernel {
    state: Mutex<KernelState>,
    owner: AtomicU64,
}

impl Kernel {
    pub fn new(heap: Heap) -> Self {
        Self {
            state: Mutex::new(KernelState {
                heap,
                globals: GlobalReferenceTable::default(),
            }),
            owner: AtomicU64::new(0),
        }
    }

    /// Block until exclusive access is available, then take it for `who`.
    pub fn request(&self, who: ActivityId) -> KernelAccess<'_> {
        let guard = self.state.lock();
        self.owner.store(who.0, Ordering::Release);
        KernelAccess {
            kernel: self,
            guard: Some(guard),
            who,
        }
    }

    /// The activity currently holding access, if any. Advisory only.
    pub fn owner(&self) -> Option<ActivityId> {
        match self.owner.load(Ordering::Acquire) {
            0 => None,
            id => Some(ActivityId(id)),
        }
    }
}

/// Scoped proof of kernel access. Releases on every exit path, including
/// unwind. The fair unlock hands the lock to a queued waiter instead of
/// letting the releasing thread immediately retake it.
#[derive(Debug)]
pub struct KernelAccess<'a> {
    kernel: &'a Kernel,
    guard: Option<MutexGuard<'a, KernelState>>,
    who: ActivityId,
}

impl Drop for KernelAccess<'_> {
    fn drop(&mut self) {
        self.kernel.owner.store(0, Ordering::Release);
        if let Some(guard) = self.guard.take() {
            MutexGuard::unlock_fair(guard);
        }
    }
}

impl Deref for KernelAccess<'_> {
    type Target = KernelState;

    fn deref(&self) -> &KernelState {
        self.guard.as_ref().expect("kernel access already released")
    }
}

impl DerefMut for KernelAccess<'_> {
    fn deref_mut(&mut self) -> &mut KernelState {
        self.guard.as_mut().expect("kernel access already released")
    }
}

impl<'a> KernelAccess<'a> {
    pub fn who(&self) -> ActivityId {
        self.who
    }

    /// Release and immediately reacquire, giving queued waiters a chance to
    /// run first. This is the yield after a variable-drop notification.
    pub fn yield_to_waiters(self) -> KernelAccess<'a> {
        let kernel = self.kernel;
        let who = self.who;
        drop(self);
        kernel.request(who)
    }

    /// Release access, run `wait`, reacquire. Used to park on a guard
    /// without holding the kernel.
    pub fn suspend_with(self, wait: impl FnOnce()) -> KernelAccess<'a> {
        let kernel = self.kernel;
        let who = self.who;
        drop(self);
        wait();
        kernel.request(who)
    }

    /// Run external code with the kernel released. Inside `call` no
    /// interpreter state may be touched by this thread.
    pub fn run_outside<R>(
        self,
        call: impl FnOnce() -> R,
    ) -> (KernelAccess<'a>, R) {
        let kernel = self.kernel;
        let who = self.who;
        drop(self);
        let result = call();
        (kernel.request(who), result)
    }
}
