pub mod message_channel;
pub mod plain_harness;

use std::sync::Arc;

#[cfg(test)] use mockall::automock;

use crate::stack::message_channel::MessageChannel;
use crate::transport::MessageTransport;

/// a transport carrying application messages directly
pub const STACK_LAYER_PLAIN: u8 = 0;
/// a transport with a once-and-only-once delivery layer on top
pub const STACK_LAYER_OOO: u8 = 1;

/// The protocol layers bound to one [crate::connection_id::ConnectionId]: a transport and the
///  message channel on top of it. On the server side, a harness outlives the physical
///  connections of its transport, so it survives client reconnects.
pub trait NetworkStackHarness: Send + Sync + 'static {
    fn transport(&self) -> &Arc<MessageTransport>;
    fn channel(&self) -> &Arc<MessageChannel>;
}

#[cfg_attr(test, automock)]
pub trait NetworkStackHarnessFactory: Send + Sync + 'static {
    /// called when a new client attaches or a rebuilt stack is restored; the transport is not
    ///  connected yet
    fn create_harness(&self, transport: Arc<MessageTransport>) -> Arc<dyn NetworkStackHarness>;
}
