//! Common test utilities for oswin integration tests.

#![allow(dead_code)]

use std::rc::Rc;

use oswin::test_utils::{FakeFabric, FakeHelper, LocalExchange};
use oswin::{Environment, Rank, Window, WindowConfig};

/// Window type over the in-memory fakes.
pub type TestWindow = Window<FakeFabric, FakeHelper, LocalExchange>;

/// One simulated group member: environment, fabric, helper, exchange.
pub struct TestGroup {
    pub env: Rc<Environment>,
    pub fabric: Rc<FakeFabric>,
    pub helper: Rc<FakeHelper>,
    pub exchange: Rc<LocalExchange>,
}

impl TestGroup {
    /// Group of `size` ranks with identity world mapping, viewed from
    /// `rank`.
    pub fn new(rank: Rank, size: u32) -> Self {
        Self {
            env: Rc::new(Environment::new()),
            fabric: Rc::new(FakeFabric::new()),
            helper: Rc::new(FakeHelper::new()),
            exchange: Rc::new(LocalExchange::new(rank, size)),
        }
    }

    /// Group with an explicit group-to-world rank mapping.
    pub fn with_world_ranks(rank: Rank, world_ranks: Vec<Rank>) -> Self {
        Self {
            env: Rc::new(Environment::new()),
            fabric: Rc::new(FakeFabric::new()),
            helper: Rc::new(FakeHelper::new()),
            exchange: Rc::new(LocalExchange::with_world_ranks(rank, world_ranks)),
        }
    }

    /// Window over window-allocated memory.
    pub fn window(&self, size: u64) -> TestWindow {
        Window::allocate(
            Rc::clone(&self.env),
            Rc::clone(&self.fabric),
            Rc::clone(&self.helper),
            Rc::clone(&self.exchange),
            WindowConfig::default(),
            size,
        )
        .expect("window creation failed")
    }

    /// Window with a custom configuration.
    pub fn window_with_config(&self, size: u64, config: WindowConfig) -> TestWindow {
        Window::allocate(
            Rc::clone(&self.env),
            Rc::clone(&self.fabric),
            Rc::clone(&self.helper),
            Rc::clone(&self.exchange),
            config,
            size,
        )
        .expect("window creation failed")
    }

    /// Dynamic window.
    pub fn dynamic_window(&self) -> TestWindow {
        Window::create_dynamic(
            Rc::clone(&self.env),
            Rc::clone(&self.fabric),
            Rc::clone(&self.helper),
            Rc::clone(&self.exchange),
            WindowConfig::default(),
        )
        .expect("window creation failed")
    }
}

/// Address of a peer's window lock word.
pub fn lock_word_addr(win: &TestWindow, peer: Rank) -> u64 {
    win.state_addr(peer) + oswin::state::LOCK_WORD_OFFSET
}

/// Address of a peer's accumulate/state lock word.
pub fn acc_lock_addr(win: &TestWindow, peer: Rank) -> u64 {
    win.state_addr(peer) + oswin::state::ACC_LOCK_WORD_OFFSET
}
