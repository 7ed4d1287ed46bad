//! Host environment signals: network connectivity and page visibility.
//!
//! The client never talks to the host environment directly. It observes
//! two boolean sources injected at construction; the default environment
//! is permanently online and visible. Tests (and real hosts) drive an
//! [`EnvironmentHandle`].

use std::sync::Arc;

use tokio::sync::watch;

/// Observable environment state handed to the client.
#[derive(Clone)]
pub struct Environment {
    pub online: watch::Receiver<bool>,
    pub visible: watch::Receiver<bool>,
    // keeps default senders alive so receivers stay readable
    _keepalive: Option<Arc<EnvironmentHandle>>,
}

/// Writer half used by the host to push signal changes.
pub struct EnvironmentHandle {
    online: watch::Sender<bool>,
    visible: watch::Sender<bool>,
}

impl EnvironmentHandle {
    /// A fresh handle/environment pair, initially online and visible.
    pub fn new() -> (Self, Environment) {
        let (online_tx, online_rx) = watch::channel(true);
        let (visible_tx, visible_rx) = watch::channel(true);
        let handle = Self {
            online: online_tx,
            visible: visible_tx,
        };
        let environment = Environment {
            online: online_rx,
            visible: visible_rx,
            _keepalive: None,
        };
        (handle, environment)
    }

    pub fn set_online(&self, online: bool) {
        let _ = self.online.send(online);
    }

    pub fn set_visible(&self, visible: bool) {
        let _ = self.visible.send(visible);
    }
}

impl Environment {
    /// Default environment: always online, always visible.
    pub fn always_on() -> Self {
        let (handle, mut environment) = EnvironmentHandle::new();
        environment._keepalive = Some(Arc::new(handle));
        environment
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_always_on_reads_true() {
        let env = Environment::always_on();
        assert!(*env.online.borrow());
        assert!(*env.visible.borrow());
    }

    #[tokio::test]
    async fn test_handle_drives_receivers() {
        let (handle, env) = EnvironmentHandle::new();
        let mut online = env.online.clone();
        handle.set_online(false);
        online.changed().await.unwrap();
        assert!(!*online.borrow());
        handle.set_online(true);
        online.changed().await.unwrap();
        assert!(*online.borrow());
    }
}
