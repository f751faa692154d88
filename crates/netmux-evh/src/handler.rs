//! Application callbacks.

use netmux_core::NetResult;

use crate::connection::{ConnId, Connection};

/// Callbacks a worker invokes for the connections it owns.
///
/// One handler instance is shared by every worker, so callbacks for
/// different connections may run concurrently. Callbacks for one
/// connection always run on its owning worker, in order.
///
/// Each connection carries a `State` value created by `on_accept`. It is
/// handed to every later callback and given back to `on_close`.
///
/// An `Err` from `on_accept`, `on_read` or `on_writable` closes the
/// connection.
pub trait Handler: Send + Sync + 'static {
    /// Per-connection application state.
    type State: Send + 'static;

    /// A connection was adopted by a worker (inbound or outbound).
    ///
    /// On `Err` the connection is closed without `on_close`.
    fn on_accept(&self, conn: &mut Connection) -> NetResult<Self::State>;

    /// Bytes arrived. `data` is only valid for the duration of the call.
    fn on_read(&self, conn: &mut Connection, state: &mut Self::State, data: &[u8]) -> NetResult<()>;

    /// The socket drained and can take more bytes. Only called after
    /// [`Connection::notify_writable`], once per request.
    fn on_writable(&self, _conn: &mut Connection, _state: &mut Self::State) -> NetResult<()> {
        Ok(())
    }

    /// The connection is gone; its descriptor is already closed.
    fn on_close(&self, _id: ConnId, _state: Self::State) {}
}
