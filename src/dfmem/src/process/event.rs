//! Single-threaded wait primitives.
//!
//! The cache and vectorizer only need two things from the scheduler:
//! FIFO-ish resumption and the ability to await an event set by another
//! task on the same driver. These are that, with no atomics; everything
//! runs on one cooperative executor.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

#[derive(Default)]
struct EventState {
    set: bool,
    wakers: Vec<Waker>,
}

/// An event that stays set once signalled; all waiters are released.
#[derive(Clone, Default)]
pub struct ManualEvent {
    state: Rc<RefCell<EventState>>,
}

impl ManualEvent {
    pub fn new() -> ManualEvent {
        ManualEvent::default()
    }

    pub fn set(&self) {
        let wakers = {
            let mut state = self.state.borrow_mut();
            state.set = true;
            std::mem::take(&mut state.wakers)
        };
        for waker in wakers {
            waker.wake();
        }
    }

    pub fn is_set(&self) -> bool {
        self.state.borrow().set
    }

    pub fn wait(&self) -> ManualWait {
        ManualWait {
            event: self.clone(),
        }
    }
}

pub struct ManualWait {
    event: ManualEvent,
}

impl Future for ManualWait {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut state = self.event.state.borrow_mut();
        if state.set {
            Poll::Ready(())
        } else {
            state.wakers.push(cx.waker().clone());
            Poll::Pending
        }
    }
}

/// An event whose signal is consumed by the next successful wait.
#[derive(Clone, Default)]
pub struct AutoResetEvent {
    state: Rc<RefCell<EventState>>,
}

impl AutoResetEvent {
    pub fn new() -> AutoResetEvent {
        AutoResetEvent::default()
    }

    /// Latch the event and wake one waiter.
    pub fn set(&self) {
        let waker = {
            let mut state = self.state.borrow_mut();
            state.set = true;
            state.wakers.pop()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    pub fn wait(&self) -> AutoResetWait {
        AutoResetWait {
            event: self.clone(),
        }
    }
}

pub struct AutoResetWait {
    event: AutoResetEvent,
}

impl Future for AutoResetWait {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut state = self.event.state.borrow_mut();
        if state.set {
            state.set = false;
            Poll::Ready(())
        } else {
            state.wakers.push(cx.waker().clone());
            Poll::Pending
        }
    }
}
