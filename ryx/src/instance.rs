use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

use log::{debug, info};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::activation::Activation;
use crate::activity::{Activity, ActivityId, ActivityKind, RaiseOutcome};
use crate::condition::{Condition, ConditionCode};
use crate::dispatch::{
    NativeContext, PackageEntry, PackageRegistry, StubOutcome, stub_call,
};
use crate::heap::{GcStats, Heap, HeapCreateInfo};
use crate::kernel::{Kernel, KernelAccess};
use crate::object::ObjRef;
use crate::value::{ValueDescriptor, check_arguments};

pub const EXIT_SLOT_COUNT: usize = 5;

/// Interception points offered to the embedding application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitSlot {
    InputOutput,
    HaltTest,
    TraceTest,
    Command,
    Termination,
}

impl ExitSlot {
    fn index(self) -> usize {
        match self {
            ExitSlot::InputOutput => 0,
            ExitSlot::HaltTest => 1,
            ExitSlot::TraceTest => 2,
            ExitSlot::Command => 3,
            ExitSlot::Termination => 4,
        }
    }
}

/// An exit returns its reply, or nothing to decline the interception.
pub type ExitFn = fn(&str) -> Option<String>;

#[derive(Debug, Clone, Default)]
pub enum ExitHandler {
    #[default]
    Unregistered,
    /// Resolved by name through the instance exit registry.
    Registered(String),
    Direct(ExitFn),
}

/// Per-activity exit configuration. Snapshotted across nested calls, so a
/// callee's changes never leak to its caller.
#[derive(Debug, Clone)]
pub struct ExitTable {
    slots: [ExitHandler; EXIT_SLOT_COUNT],
}

impl Default for ExitTable {
    fn default() -> Self {
        Self {
            slots: std::array::from_fn(|_| ExitHandler::Unregistered),
        }
    }
}

impl ExitTable {
    pub fn get(&self, slot: ExitSlot) -> &ExitHandler {
        &self.slots[slot.index()]
    }

    pub fn set(&mut self, slot: ExitSlot, handler: ExitHandler) {
        self.slots[slot.index()] = handler;
    }
}

#[derive(Debug, Clone)]
pub struct InstanceCreateInfo {
    pub heap: HeapCreateInfo,
    /// Initial address environment for commands.
    pub environment: String,
    pub exits: ExitTable,
}

impl Default for InstanceCreateInfo {
    fn default() -> Self {
        Self {
            heap: HeapCreateInfo::default(),
            environment: "CMD".to_string(),
            exits: ExitTable::default(),
        }
    }
}

/// One embedded interpreter: the kernel lock and heap, the activity
/// roster, the package registry, and the exit configuration.
pub struct InterpreterInstance {
    kernel: Kernel,
    activities: RwLock<HashMap<u64, Arc<Activity>>>,
    root: Arc<Activity>,
    next_id: AtomicU64,
    environment: Mutex<String>,
    packages: RwLock<PackageRegistry>,
    exit_registry: RwLock<HashMap<String, ExitFn>>,
    default_exits: ExitTable,
    attached: Mutex<usize>,
    terminated: Condvar,
}

impl InterpreterInstance {
    pub fn create(info: InstanceCreateInfo) -> Arc<Self> {
        let root = Activity::with_exits(
            ActivityId(1),
            ActivityKind::Root,
            info.exits.clone(),
        );
        info!("interpreter instance created, environment {}", info.environment);
        Arc::new(Self {
            kernel: Kernel::new(Heap::new(info.heap)),
            activities: RwLock::new(HashMap::from([(1, root.clone())])),
            root,
            next_id: AtomicU64::new(2),
            environment: Mutex::new(info.environment),
            packages: RwLock::new(PackageRegistry::new()),
            exit_registry: RwLock::new(HashMap::new()),
            default_exits: info.exits,
            attached: Mutex::new(0),
            terminated: Condvar::new(),
        })
    }

    pub fn root_activity(&self) -> Arc<Activity> {
        self.root.clone()
    }

    pub fn activity(&self, id: ActivityId) -> Option<Arc<Activity>> {
        self.activities.read().get(&id.0).cloned()
    }

    pub fn spawn_activity(&self) -> Arc<Activity> {
        self.new_activity(ActivityKind::Spawned)
    }

    /// Bind an application thread to the instance. The instance will not
    /// terminate while attached threads remain.
    pub fn attach_thread(&self) -> Arc<Activity> {
        let activity = self.new_activity(ActivityKind::Attached);
        *self.attached.lock() += 1;
        activity
    }

    pub fn detach_thread(&self, activity: &Arc<Activity>) {
        self.activities.write().remove(&activity.id.0);
        let mut attached = self.attached.lock();
        *attached = attached.saturating_sub(1);
        self.terminated.notify_all();
    }

    fn new_activity(&self, kind: ActivityKind) -> Arc<Activity> {
        let id = ActivityId(self.next_id.fetch_add(1, Relaxed));
        let activity =
            Activity::with_exits(id, kind, self.default_exits.clone());
        self.activities.write().insert(id.0, activity.clone());
        debug!("activity {} created ({kind:?})", id.0);
        activity
    }

    /// Block until every attached thread has detached.
    pub fn terminate(&self) {
        let mut attached = self.attached.lock();
        while *attached > 0 {
            self.terminated.wait(&mut attached);
        }
        info!("interpreter instance terminated");
    }

    /// Take exclusive kernel access on behalf of an activity.
    pub fn enter(&self, activity: &Arc<Activity>) -> KernelAccess<'_> {
        self.kernel.request(activity.id)
    }

    pub fn environment(&self) -> String {
        self.environment.lock().clone()
    }

    pub fn set_environment(&self, environment: &str) {
        *self.environment.lock() = environment.to_string();
    }

    // packages and exits

    pub fn register_package(
        &self,
        package: &'static PackageEntry,
    ) -> Result<(), Condition> {
        self.packages.write().register(package)
    }

    pub fn register_exit(&self, name: &str, exit: ExitFn) {
        self.exit_registry.write().insert(name.to_string(), exit);
    }

    /// Drive an exit interception point. The exit runs with the kernel
    /// released; external code must never hold it.
    pub fn call_exit<'a>(
        &self,
        activity: &Arc<Activity>,
        access: KernelAccess<'a>,
        slot: ExitSlot,
        payload: &str,
    ) -> (KernelAccess<'a>, Option<String>) {
        let exit = match activity.exit_table().get(slot) {
            ExitHandler::Unregistered => return (access, None),
            ExitHandler::Direct(exit) => *exit,
            ExitHandler::Registered(name) => {
                match self.exit_registry.read().get(name).copied() {
                    Some(exit) => exit,
                    None => return (access, None),
                }
            }
        };
        let payload = payload.to_string();
        access.run_outside(move || exit(&payload))
    }

    // global references

    pub fn request_global_reference(
        &self,
        access: &mut KernelAccess<'_>,
        r: ObjRef,
    ) {
        access.globals.add(r);
    }

    pub fn remove_global_reference(
        &self,
        access: &mut KernelAccess<'_>,
        r: ObjRef,
    ) -> bool {
        access.globals.remove(r)
    }

    /// Collect garbage: roots are every activity's live frames plus the
    /// global reference table.
    pub fn collect(&self, access: &mut KernelAccess<'_>) -> GcStats {
        let mut roots = Vec::new();
        {
            let activities = self.activities.read();
            for activity in activities.values() {
                activity.visit_stack_roots(&mut |r| roots.push(r));
            }
        }
        access.globals.visit(&mut |r| roots.push(r));
        access.heap.collect(&roots)
    }

    // guard protocol

    /// Reserve a variable pool, blocking until it is free. Deadlock among
    /// waiting activities is detected and raised rather than hung on.
    pub fn guard_acquire<'a>(
        &self,
        activity: &Arc<Activity>,
        mut access: KernelAccess<'a>,
        pool: ObjRef,
    ) -> (KernelAccess<'a>, Result<(), Condition>) {
        let id = activity.id;
        loop {
            let owner = {
                let dict = match access.heap.variables_mut(pool) {
                    Some(dict) => dict,
                    None => {
                        return (
                            access,
                            Err(Condition::new(
                                ConditionCode::Failure,
                                "guard target is not a variable pool",
                            )),
                        );
                    }
                };
                match dict.try_reserve(id) {
                    Ok(()) => {
                        dict.remove_waiter(id);
                        None
                    }
                    Err(owner) => Some(owner),
                }
            };
            let owner = match owner {
                None => return (access, Ok(())),
                Some(owner) => owner,
            };

            if self.would_deadlock(id, owner) {
                if let Some(dict) = access.heap.variables_mut(pool) {
                    dict.remove_waiter(id);
                }
                return (
                    access,
                    Err(Condition::new(
                        ConditionCode::Deadlock,
                        format!(
                            "activity {} cannot wait for activity {}: \
                             circular guard wait",
                            id.0, owner.0
                        ),
                    )),
                );
            }

            if let Some(dict) = access.heap.variables_mut(pool) {
                dict.enqueue_waiter(id);
            }
            activity.set_waiting_on(Some(owner));
            let parked = activity.clone();
            access = access.suspend_with(move || parked.guard_wait_park());
            activity.set_waiting_on(None);
        }
    }

    /// Walk the waits-for chain from `owner`; a path back to `waiter`
    /// means the new wait would close a cycle.
    fn would_deadlock(&self, waiter: ActivityId, owner: ActivityId) -> bool {
        let activities = self.activities.read();
        let mut visited = HashSet::new();
        let mut current = owner;
        loop {
            if current == waiter {
                return true;
            }
            if !visited.insert(current) {
                return false;
            }
            match activities
                .get(&current.0)
                .and_then(|activity| activity.waiting_on())
            {
                Some(next) => current = next,
                None => return false,
            }
        }
    }

    /// Release one nesting level of a pool reservation; a full release
    /// wakes the waiters with the kernel free and yields to them.
    pub fn guard_release<'a>(
        &self,
        activity: &Arc<Activity>,
        mut access: KernelAccess<'a>,
        pool: ObjRef,
    ) -> KernelAccess<'a> {
        let woken = access
            .heap
            .variables_mut(pool)
            .map(|dict| dict.release(activity.id))
            .unwrap_or_default();
        self.post_outside(activity, access, woken)
    }

    /// Assign an object variable and wake its change dependents.
    pub fn set_object_variable<'a>(
        &self,
        activity: &Arc<Activity>,
        mut access: KernelAccess<'a>,
        pool: ObjRef,
        name: &str,
        value: ObjRef,
    ) -> KernelAccess<'a> {
        let notified = access
            .heap
            .variables_mut(pool)
            .map(|dict| dict.set(name, value))
            .unwrap_or_default();
        self.post_outside(activity, access, notified)
    }

    /// Drop an object variable and wake its change dependents. Each
    /// dependent receives exactly one post per drop.
    pub fn drop_object_variable<'a>(
        &self,
        activity: &Arc<Activity>,
        mut access: KernelAccess<'a>,
        pool: ObjRef,
        name: &str,
    ) -> KernelAccess<'a> {
        let notified = access
            .heap
            .variables_mut(pool)
            .map(|dict| dict.drop_variable(name))
            .unwrap_or_default();
        self.post_outside(activity, access, notified)
    }

    /// Deliver guard posts with the kernel released, then reacquire. The
    /// fair hand-off lets a woken activity in before the poster resumes.
    fn post_outside<'a>(
        &self,
        activity: &Arc<Activity>,
        access: KernelAccess<'a>,
        ids: Vec<ActivityId>,
    ) -> KernelAccess<'a> {
        if ids.is_empty() {
            return access;
        }
        let targets: Vec<Arc<Activity>> = {
            let activities = self.activities.read();
            ids.iter()
                .filter(|&&id| id != activity.id)
                .filter_map(|id| activities.get(&id.0).cloned())
                .collect()
        };
        if targets.is_empty() {
            return access;
        }
        debug!(
            "activity {} posting {} guard waiters",
            activity.id.0,
            targets.len()
        );
        let (access, ()) = access.run_outside(move || {
            for target in &targets {
                target.guard_post();
            }
        });
        access
    }

    // native dispatch

    /// Invoke a native-code object: the full call protocol from safe-point
    /// checks through argument validation, guard handling, the stub, and
    /// unwind-safe teardown.
    pub fn run_native<'a>(
        &self,
        activity: &Arc<Activity>,
        mut access: KernelAccess<'a>,
        code: ObjRef,
        receiver: Option<ObjRef>,
        object_variables: Option<ObjRef>,
        message: &str,
        args: &[ValueDescriptor],
    ) -> (KernelAccess<'a>, Result<ValueDescriptor, Condition>) {
        if let Some(halt) = activity.poll_halt() {
            return (access, Err(raise_now(activity, halt)));
        }
        if activity.trace_enabled() {
            debug!(
                "activity {} >>> {} ({} args)",
                activity.id.0,
                message,
                args.len()
            );
        }
        if let Err(condition) = activity.check_stack_space() {
            return (access, Err(raise_now(activity, condition)));
        }

        let entry = {
            let registry = self.packages.read();
            let native = match access.heap.native_code_mut(code) {
                Some(native) => native,
                None => {
                    let condition = Condition::new(
                        ConditionCode::Failure,
                        "target is not a native code object",
                    );
                    return (access, Err(raise_now(activity, condition)));
                }
            };
            match native.resolve(&registry) {
                Ok(entry) => entry,
                Err(condition) => {
                    return (access, Err(raise_now(activity, condition)));
                }
            }
        };

        activity.activate();
        let mut frame = Activation::native(message, receiver, args.to_vec());
        frame.variable_pool = object_variables;
        activity.push_frame(frame);

        let mut held_guard = false;
        if entry.guarded {
            if let Some(pool) = object_variables {
                let (a, reserved) = self.guard_acquire(activity, access, pool);
                access = a;
                match reserved {
                    Ok(()) => {
                        held_guard = true;
                        activity.with_current_frame(|f| f.guarded = true);
                    }
                    Err(condition) => {
                        let condition = raise_now(activity, condition);
                        activity.deactivate();
                        return (access, Err(condition));
                    }
                }
            }
        }

        let mut slots = Vec::with_capacity(args.len() + 1);
        slots.push(ValueDescriptor::Omitted);
        slots.extend_from_slice(args);

        if let Err(index) = check_arguments(entry.signature, &slots) {
            let condition = Condition::new(
                ConditionCode::BadArgument,
                format!("argument {index} does not match the declared type"),
            )
            .with_subcode(index as i32);
            let condition = raise_now(activity, condition);
            if held_guard {
                if let Some(pool) = object_variables {
                    access = self.guard_release(activity, access, pool);
                }
            }
            activity.deactivate();
            return (access, Err(condition));
        }

        let outcome;
        let posts;
        {
            let mut context = NativeContext::new(
                activity,
                &mut access,
                receiver,
                object_variables,
            );
            outcome = stub_call(entry, Some((&mut context, &mut slots)));
            posts = context.take_pending_posts();
        }

        // raise before teardown so the native frame is still on the stack
        // when the traceback is captured
        let result = match outcome {
            StubOutcome::Completed => Ok(slots.swap_remove(0)),
            StubOutcome::Raised(condition) => {
                Err(raise_now(activity, condition))
            }
            StubOutcome::Signature(_) => {
                unreachable!("invocation never reports a signature")
            }
        };

        if held_guard {
            if let Some(pool) = object_variables {
                access = self.guard_release(activity, access, pool);
            }
        }
        activity.deactivate();

        access = self.post_outside(activity, access, posts);
        (access, result)
    }
}

/// Route a condition through the activation chain; the caller gets the
/// condition back regardless of whether a frame trapped it.
fn raise_now(activity: &Arc<Activity>, condition: Condition) -> Condition {
    match activity.raise(condition) {
        RaiseOutcome::Handled { condition, .. } => condition,
        RaiseOutcome::Unhandled(condition) => condition,
    }
}
