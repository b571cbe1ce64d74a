//! A small, type-indexed attribute map.
//!
//! Resolvers attach per-address and per-endpoint data (authority overrides,
//! LB tokens) as typed values; consumers look them up by type. Equality and
//! ordering are structural so that addresses carrying attributes can key the
//! subchannel pool.

use std::any::{Any, TypeId};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

/// Ensures only types that support comparison can be inserted into the
/// `Attributes` struct. This allows the use of value-based equality rather
/// than relying on pointer comparisons.
trait AttributeValue: Any + Send + Sync + Debug {
    fn any_ref(&self) -> &dyn Any;
    fn dyn_eq(&self, other: &dyn AttributeValue) -> bool;
    fn dyn_cmp(&self, other: &dyn AttributeValue) -> Ordering;
}

impl<T: Any + Send + Sync + Eq + Ord + Debug> AttributeValue for T {
    fn any_ref(&self) -> &dyn Any {
        self
    }

    fn dyn_eq(&self, other: &dyn AttributeValue) -> bool {
        match other.any_ref().downcast_ref::<T>() {
            Some(other) => self == other,
            None => false,
        }
    }

    fn dyn_cmp(&self, other: &dyn AttributeValue) -> Ordering {
        match other.any_ref().downcast_ref::<T>() {
            Some(other) => self.cmp(other),
            // Fallback for safety, though the map structure guarantees
            // same-type comparison.
            None => TypeId::of::<T>().cmp(&other.any_ref().type_id()),
        }
    }
}

/// A collection of attribute values indexed by their type.
#[derive(Clone, Default, Debug)]
pub struct Attributes {
    map: BTreeMap<TypeId, Arc<dyn AttributeValue>>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy with `value` added, replacing any existing value of the
    /// same type.
    pub fn with<T: Send + Sync + Eq + Ord + Debug + 'static>(&self, value: T) -> Self {
        let mut map = self.map.clone();
        map.insert(TypeId::of::<T>(), Arc::new(value));
        Attributes { map }
    }

    /// Looks up the value of type `T`, if present.
    pub fn get<T: 'static>(&self) -> Option<&T> {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|v| v.any_ref().downcast_ref::<T>())
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl PartialEq for Attributes {
    fn eq(&self, other: &Self) -> bool {
        self.map.len() == other.map.len()
            && self
                .map
                .iter()
                .zip(other.map.iter())
                .all(|((ka, va), (kb, vb))| ka == kb && va.dyn_eq(vb.as_ref()))
    }
}

impl Eq for Attributes {}

impl PartialOrd for Attributes {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Attributes {
    fn cmp(&self, other: &Self) -> Ordering {
        let mut a = self.map.iter();
        let mut b = other.map.iter();
        loop {
            match (a.next(), b.next()) {
                (None, None) => return Ordering::Equal,
                (None, Some(_)) => return Ordering::Less,
                (Some(_), None) => return Ordering::Greater,
                (Some((ka, va)), Some((kb, vb))) => {
                    match ka.cmp(kb).then_with(|| va.dyn_cmp(vb.as_ref())) {
                        Ordering::Equal => continue,
                        non_eq => return non_eq,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
    struct LbToken(String);

    #[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
    struct Weight(u32);

    #[test]
    fn insert_and_get() {
        let attrs = Attributes::new()
            .with(LbToken("abc".into()))
            .with(Weight(7));
        assert_eq!(attrs.get::<LbToken>(), Some(&LbToken("abc".into())));
        assert_eq!(attrs.get::<Weight>(), Some(&Weight(7)));
        assert!(Attributes::new().get::<Weight>().is_none());
    }

    #[test]
    fn replace_same_type() {
        let attrs = Attributes::new().with(Weight(1)).with(Weight(2));
        assert_eq!(attrs.get::<Weight>(), Some(&Weight(2)));
    }

    #[test]
    fn structural_equality() {
        let a = Attributes::new().with(Weight(1)).with(LbToken("t".into()));
        let b = Attributes::new().with(LbToken("t".into())).with(Weight(1));
        assert_eq!(a, b);

        let c = Attributes::new().with(Weight(2));
        assert_ne!(a, c);
        assert!(a.cmp(&c) != Ordering::Equal);
    }
}
