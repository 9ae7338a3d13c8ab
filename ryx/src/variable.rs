use std::collections::BTreeMap;

use crate::activity::ActivityId;
use crate::object::ObjRef;

/// One named binding. The dependents set holds activities blocked on a
/// guard expression over this variable; they are woken when the value is
/// dropped or reassigned. An emptied set is released, not kept around.
#[derive(Debug, Clone)]
pub struct Variable {
    name: String,
    value: Option<ObjRef>,
    dependents: Option<Vec<ActivityId>>,
}

impl Variable {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            value: None,
            dependents: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> Option<ObjRef> {
        self.value
    }

    pub fn is_set(&self) -> bool {
        self.value.is_some()
    }

    /// Assign a new value. Returns the activities to guard-post.
    pub fn assign(&mut self, value: ObjRef) -> Vec<ActivityId> {
        self.value = Some(value);
        self.dependents_snapshot()
    }

    /// Clear the value. Returns the activities to guard-post.
    pub fn drop_value(&mut self) -> Vec<ActivityId> {
        self.value = None;
        self.dependents_snapshot()
    }

    pub fn inform(&mut self, activity: ActivityId) {
        let dependents = self.dependents.get_or_insert_with(Vec::new);
        if !dependents.contains(&activity) {
            dependents.push(activity);
        }
    }

    pub fn uninform(&mut self, activity: ActivityId) {
        if let Some(dependents) = self.dependents.as_mut() {
            dependents.retain(|&d| d != activity);
            if dependents.is_empty() {
                self.dependents = None;
            }
        }
    }

    pub fn has_dependents(&self) -> bool {
        self.dependents.is_some()
    }

    pub fn dependent_count(&self) -> usize {
        self.dependents.as_ref().map_or(0, Vec::len)
    }

    fn dependents_snapshot(&self) -> Vec<ActivityId> {
        self.dependents.clone().unwrap_or_default()
    }
}

/// Exclusive-access reservation state of one variable pool. A guarded
/// method holds the reservation for the duration of its run; re-entry by
/// the owning activity nests via `count`.
#[derive(Debug, Clone, Default)]
struct GuardReservation {
    owner: Option<ActivityId>,
    count: usize,
    waiters: Vec<ActivityId>,
}

/// An object's variable pool: named bindings plus the guard reservation.
/// BTreeMap keeps iteration order stable for the pool cursor protocol.
#[derive(Debug, Clone, Default)]
pub struct VariableDictionary {
    vars: BTreeMap<String, Variable>,
    guard: GuardReservation,
}

impl VariableDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Variable> {
        self.vars.get(name)
    }

    /// Variables come into existence on first reference.
    pub fn ensure(&mut self, name: &str) -> &mut Variable {
        self.vars
            .entry(name.to_string())
            .or_insert_with(|| Variable::new(name))
    }

    pub fn set(&mut self, name: &str, value: ObjRef) -> Vec<ActivityId> {
        self.ensure(name).assign(value)
    }

    pub fn drop_variable(&mut self, name: &str) -> Vec<ActivityId> {
        match self.vars.get_mut(name) {
            Some(var) => var.drop_value(),
            None => Vec::new(),
        }
    }

    pub fn inform(&mut self, name: &str, activity: ActivityId) {
        self.ensure(name).inform(activity);
    }

    pub fn uninform(&mut self, name: &str, activity: ActivityId) {
        if let Some(var) = self.vars.get_mut(name) {
            var.uninform(activity);
        }
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Snapshot of variable names in iteration order, for the pool cursor.
    pub fn names(&self) -> Vec<String> {
        self.vars.keys().cloned().collect()
    }

    pub fn visit_values(&self, visit: &mut dyn FnMut(ObjRef)) {
        for var in self.vars.values() {
            if let Some(value) = var.value {
                visit(value);
            }
        }
    }

    pub fn map_values(&mut self, map: &mut dyn FnMut(ObjRef) -> ObjRef) {
        for var in self.vars.values_mut() {
            if let Some(value) = var.value {
                var.value = Some(map(value));
            }
        }
    }

    // guard reservation

    /// Try to reserve the pool. Re-entry by the current owner nests.
    /// On contention returns the owning activity.
    pub fn try_reserve(
        &mut self,
        activity: ActivityId,
    ) -> Result<(), ActivityId> {
        match self.guard.owner {
            None => {
                self.guard.owner = Some(activity);
                self.guard.count = 1;
                Ok(())
            }
            Some(owner) if owner == activity => {
                self.guard.count += 1;
                Ok(())
            }
            Some(owner) => Err(owner),
        }
    }

    /// Release one nesting level. When the reservation fully drops, returns
    /// the waiters to guard-post; wake order among them is unspecified.
    pub fn release(&mut self, activity: ActivityId) -> Vec<ActivityId> {
        if self.guard.owner != Some(activity) {
            return Vec::new();
        }
        self.guard.count -= 1;
        if self.guard.count == 0 {
            self.guard.owner = None;
            std::mem::take(&mut self.guard.waiters)
        } else {
            Vec::new()
        }
    }

    pub fn enqueue_waiter(&mut self, activity: ActivityId) {
        if !self.guard.waiters.contains(&activity) {
            self.guard.waiters.push(activity);
        }
    }

    pub fn remove_waiter(&mut self, activity: ActivityId) {
        self.guard.waiters.retain(|&w| w != activity);
    }

    pub fn reserved_by(&self) -> Option<ActivityId> {
        self.guard.owner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: ActivityId = ActivityId(1);
    const B: ActivityId = ActivityId(2);
    const C: ActivityId = ActivityId(3);

    #[test]
    fn drop_notifies_each_dependent_once() {
        let mut var = Variable::new("RESULT");
        var.inform(A);
        var.inform(B);
        var.inform(A); // duplicate registration is idempotent

        let notified = var.drop_value();
        assert_eq!(notified.len(), 2);
        assert!(notified.contains(&A));
        assert!(notified.contains(&B));
    }

    #[test]
    fn emptied_dependents_set_is_released() {
        let mut var = Variable::new("X");
        var.inform(A);
        var.inform(B);
        assert!(var.has_dependents());

        var.uninform(A);
        assert!(var.has_dependents());
        var.uninform(B);
        assert!(!var.has_dependents());
        assert_eq!(var.dependent_count(), 0);
    }

    #[test]
    fn assignment_also_notifies() {
        let mut var = Variable::new("X");
        var.inform(C);
        let notified = var.assign(ObjRef(9));
        assert_eq!(notified, vec![C]);
        assert_eq!(var.value(), Some(ObjRef(9)));
    }

    #[test]
    fn variables_appear_on_first_reference() {
        let mut dict = VariableDictionary::new();
        assert!(dict.get("COUNT").is_none());
        dict.ensure("COUNT");
        assert!(dict.get("COUNT").is_some());
        assert!(!dict.get("COUNT").unwrap().is_set());
    }

    #[test]
    fn names_are_sorted_and_stable() {
        let mut dict = VariableDictionary::new();
        dict.set("ZULU", ObjRef(1));
        dict.set("ALPHA", ObjRef(2));
        dict.set("MIKE", ObjRef(3));
        assert_eq!(dict.names(), vec!["ALPHA", "MIKE", "ZULU"]);
    }

    #[test]
    fn reservation_nests_for_the_owner() {
        let mut dict = VariableDictionary::new();
        assert!(dict.try_reserve(A).is_ok());
        assert!(dict.try_reserve(A).is_ok());
        assert_eq!(dict.try_reserve(B), Err(A));

        assert!(dict.release(A).is_empty());
        assert_eq!(dict.reserved_by(), Some(A));
        assert!(dict.release(A).is_empty());
        assert_eq!(dict.reserved_by(), None);
    }

    #[test]
    fn full_release_hands_back_waiters() {
        let mut dict = VariableDictionary::new();
        dict.try_reserve(A).unwrap();
        dict.enqueue_waiter(B);
        dict.enqueue_waiter(C);

        let woken = dict.release(A);
        assert_eq!(woken.len(), 2);
        assert!(woken.contains(&B));
        assert!(woken.contains(&C));
        // waiter list was consumed
        assert!(dict.release(A).is_empty());
    }
}
