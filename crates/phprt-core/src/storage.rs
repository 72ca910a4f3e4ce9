// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Result cell ("Storage").
//!
//! Holds the eventual result of one suspended computation: nothing yet,
//! void, a typed value, or a propagated failure. Written once, read once;
//! reading clears the cell.

use std::any::{type_name, Any, TypeId};
use std::fmt;

use crate::error::Failure;

#[derive(Default)]
pub enum Storage {
    /// No result produced yet.
    #[default]
    Empty,
    Void,
    Value(Box<dyn Any>),
    Failed(Failure),
}

impl Storage {
    /// Wrap a finished computation's result. `()` results are stored as
    /// [`Storage::Void`].
    pub fn from_result<T: 'static>(result: Result<T, Failure>) -> Self {
        match result {
            Err(failure) => Storage::Failed(failure),
            Ok(_) if TypeId::of::<T>() == TypeId::of::<()>() => Storage::Void,
            Ok(value) => Storage::Value(Box::new(value)),
        }
    }

    pub fn value<T: 'static>(value: T) -> Self {
        Self::from_result(Ok(value))
    }

    /// Store `result`. The cell must be empty.
    pub fn save<T: 'static>(&mut self, result: Result<T, Failure>) {
        assert!(self.is_empty(), "storage already holds a result ({:?})", self);
        *self = Self::from_result(result);
    }

    pub fn save_void(&mut self, result: Result<(), Failure>) {
        self.save(result)
    }

    /// Take the stored result, leaving the cell empty.
    ///
    /// Panics if the cell is empty (double load) or holds a different type.
    pub fn load<T: 'static>(&mut self) -> Result<T, Failure> {
        match std::mem::take(self) {
            Storage::Empty => panic!("load::<{}>() from empty storage", type_name::<T>()),
            Storage::Failed(failure) => Err(failure),
            Storage::Void => {
                let unit: Box<dyn Any> = Box::new(());
                match unit.downcast::<T>() {
                    Ok(value) => Ok(*value),
                    Err(_) => panic!("load::<{}>() from void storage", type_name::<T>()),
                }
            }
            Storage::Value(boxed) => match boxed.downcast::<T>() {
                Ok(value) => Ok(*value),
                Err(_) => panic!("storage holds a value of a different type than {}", type_name::<T>()),
            },
        }
    }

    /// Whether [`load::<T>()`](Self::load) would succeed without a type
    /// mismatch. A failure loads as any type.
    pub fn holds<T: 'static>(&self) -> bool {
        match self {
            Storage::Empty => false,
            Storage::Failed(_) => true,
            Storage::Void => TypeId::of::<T>() == TypeId::of::<()>(),
            Storage::Value(boxed) => (**boxed).is::<T>(),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Storage::Empty)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Storage::Failed(_))
    }
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Storage::Empty => write!(f, "Empty"),
            Storage::Void => write!(f, "Void"),
            Storage::Value(_) => write!(f, "Value(..)"),
            Storage::Failed(failure) => f.debug_tuple("Failed").field(failure).finish(),
        }
    }
}
