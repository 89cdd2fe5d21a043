//! # Tunation locals
//!
//! Type-keyed values provided to everything tuned inside a block:
//!
//! ```rust
//! use retune_core::*;
//!
//! #[derive(Clone, Debug, PartialEq)]
//! struct Theme(&'static str);
//!
//! assert_eq!(local::<Theme>(), None);
//! provide(Theme("dark"), || {
//!     assert_eq!(local::<Theme>(), Some(Theme("dark")));
//!     provide(Theme("light"), || assert_eq!(local::<Theme>(), Some(Theme("light"))));
//! });
//! ```
//!
//! Child tunations capture the locals visible where they were created, so a
//! child re-tuned on its own still sees what its parent provided.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

type LocalsFrame = HashMap<TypeId, Rc<dyn Any>>;

thread_local! {
    static LOCALS_STACK: RefCell<Vec<Rc<LocalsFrame>>> = const { RefCell::new(Vec::new()) };
}

/// The locals stack at some point of a tuning pass.
#[derive(Clone, Default)]
pub struct CapturedLocals(Rc<[Rc<LocalsFrame>]>);

impl CapturedLocals {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Runs `f` with `value` provided as the local of type `T`.
pub fn provide<T: 'static, R>(value: T, f: impl FnOnce() -> R) -> R {
    let mut frame = LocalsFrame::new();
    frame.insert(TypeId::of::<T>(), Rc::new(value));
    with_locals_frame(frame, f)
}

/// The innermost provided value of type `T`, if any.
pub fn local<T: Clone + 'static>() -> Option<T> {
    LOCALS_STACK.with(|st| {
        for frame in st.borrow().iter().rev() {
            if let Some(v) = frame.get(&TypeId::of::<T>())
                && let Some(t) = v.downcast_ref::<T>()
            {
                return Some(t.clone());
            }
        }
        None
    })
}

/// Like [`local`], falling back to `T::default()`.
pub fn local_or_default<T: Clone + Default + 'static>() -> T {
    local().unwrap_or_default()
}

fn with_locals_frame<R>(frame: LocalsFrame, f: impl FnOnce() -> R) -> R {
    // Non-panicking frame guard (ensures pop on unwind)
    struct Guard;
    impl Drop for Guard {
        fn drop(&mut self) {
            LOCALS_STACK.with(|st| {
                st.borrow_mut().pop();
            });
        }
    }
    LOCALS_STACK.with(|st| st.borrow_mut().push(Rc::new(frame)));
    let _guard = Guard;
    f()
}

pub fn capture() -> CapturedLocals {
    LOCALS_STACK.with(|st| CapturedLocals(st.borrow().iter().cloned().collect()))
}

/// Replaces the locals stack with `captured` until the guard drops.
pub(crate) fn install(captured: &CapturedLocals) -> InstalledLocals {
    let saved = LOCALS_STACK.with(|st| {
        std::mem::replace(&mut *st.borrow_mut(), captured.0.iter().cloned().collect())
    });
    InstalledLocals { saved }
}

pub(crate) struct InstalledLocals {
    saved: Vec<Rc<LocalsFrame>>,
}

impl Drop for InstalledLocals {
    fn drop(&mut self) {
        let saved = std::mem::take(&mut self.saved);
        LOCALS_STACK.with(|st| *st.borrow_mut() = saved);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct Density(u32);

    #[test]
    fn innermost_value_wins_and_unwinds() {
        provide(Density(1), || {
            provide(Density(2), || assert_eq!(local::<Density>(), Some(Density(2))));
            assert_eq!(local::<Density>(), Some(Density(1)));
        });
        assert_eq!(local::<Density>(), None);
        assert_eq!(local_or_default::<u8>(), 0);
    }

    #[test]
    fn frame_pops_on_panic() {
        let result = std::panic::catch_unwind(|| {
            let _: () = provide(Density(3), || panic!("boom"));
        });
        assert!(result.is_err());
        assert_eq!(local::<Density>(), None);
    }

    #[test]
    fn captured_stack_can_be_reinstalled() {
        let captured = provide(Density(7), || provide("label", capture));
        assert!(!captured.is_empty());
        assert_eq!(local::<Density>(), None);
        {
            let _installed = install(&captured);
            assert_eq!(local::<Density>(), Some(Density(7)));
            assert_eq!(local::<&str>(), Some("label"));
        }
        assert_eq!(local::<Density>(), None);
    }
}
