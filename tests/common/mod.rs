//! Shared harness: an in-process core wired to a middleware handle over
//! a Unix socket pair, with a TCP bridge listener for peer traffic.

#![allow(dead_code)]

use std::sync::Arc;

use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;

use commux::api::Middleware;
use commux::config::Config;
use commux::core::Core;
use commux::message::generate_session_key;
use commux::transport::{ComModule, TcpModule, UnixModule};

pub struct TestNode {
    pub mw: Middleware,
    /// Bound TCP address peers can map to.
    pub addr: String,
    pub cancel: CancellationToken,
}

/// Spawns a core with unix + tcp modules and connects a middleware
/// handle to it in-process.
pub async fn spawn_node(name: &str) -> TestNode {
    let key = generate_session_key();
    let mut core = Core::new(name, &key, Config::default());

    let unix = UnixModule::new(core.events_sender());
    core.add_module(Arc::new(unix.clone()));
    let tcp = TcpModule::new(core.events_sender());
    core.add_module(Arc::new(tcp.clone()));
    let addr = tcp.listen("127.0.0.1:0").await.expect("bind tcp");

    let (core_side, api_side) = UnixStream::pair().expect("socket pair");
    let conn = unix.adopt(core_side);
    core.attach_component("unix", conn);

    let cancel = core.cancel_token();
    tokio::spawn(core.run());

    let mw = Middleware::connect_stream(name, &key, api_side)
        .await
        .expect("middleware connect");
    TestNode { mw, addr, cancel }
}

/// Polls until `check` passes or a couple of seconds elapse.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    false
}
