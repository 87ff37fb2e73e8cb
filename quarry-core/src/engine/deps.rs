//! Dependencies and change detection.
//!
//! A query declares its dependencies as a function of the store state that
//! returns an ordered list of [`Dep`]s. After every store transition the list
//! is evaluated against the old and new state; if the two lists differ, the
//! query's inputs have changed.
//!
//! Equality is type-aware:
//!
//! - queries compare by their cached value,
//! - effects compare by their completion counter,
//! - plain data compares by value,
//! - lists compare element-wise with the same rules.
//!
//! An effect never equals anything that is not an effect.

use std::rc::Rc;

use smallvec::SmallVec;

use super::{Effect, Query};
use crate::store::{Data, Slot};

/// Ordered dependency list.
pub type Deps = SmallVec<[Dep; 4]>;

/// One dependency of a query.
#[derive(Clone, Debug)]
pub enum Dep {
    Query(Rc<Query>),
    Effect(Rc<Effect>),
    Data(Data),
    List(Vec<Dep>),
}

impl From<Slot> for Dep {
    fn from(slot: Slot) -> Self {
        match slot {
            Slot::Query(q) => Dep::Query(q),
            Slot::Effect(e) => Dep::Effect(e),
            Slot::Data(d) => Dep::Data(d),
        }
    }
}

impl From<Data> for Dep {
    fn from(data: Data) -> Self {
        Dep::Data(data)
    }
}

impl From<Vec<Dep>> for Dep {
    fn from(deps: Vec<Dep>) -> Self {
        Dep::List(deps)
    }
}

/// What a dependency is compared by.
#[derive(PartialEq)]
enum Signal<'a> {
    Value(Option<&'a Data>),
    Counter(u64),
}

fn signal(dep: &Dep) -> Option<Signal<'_>> {
    match dep {
        Dep::Query(q) => Some(Signal::Value(q.value())),
        Dep::Effect(e) => Some(Signal::Counter(e.value_counter())),
        Dep::Data(d) => Some(Signal::Value(Some(d))),
        Dep::List(_) => None,
    }
}

/// Type-aware equality of two dependencies.
pub fn equals(a: &Dep, b: &Dep) -> bool {
    match (a, b) {
        (Dep::List(a), Dep::List(b)) => deps_equal(a, b),
        _ => match (signal(a), signal(b)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
    }
}

/// Element-wise equality of two dependency lists.
pub fn deps_equal(a: &[Dep], b: &[Dep]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(a, b)| equals(a, b))
}
