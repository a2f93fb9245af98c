use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::stack::message_channel::MessageChannel;
use crate::stack::{NetworkStackHarness, NetworkStackHarnessFactory};
use crate::transport::MessageTransport;

/// A transport with a [MessageChannel] directly on top of it
pub struct PlainNetworkStackHarness {
    transport: Arc<MessageTransport>,
    channel: Arc<MessageChannel>,
}

impl PlainNetworkStackHarness {
    pub fn new(transport: Arc<MessageTransport>, queue_size: usize) -> Arc<PlainNetworkStackHarness> {
        let channel = MessageChannel::attach(&transport, queue_size);
        Arc::new(PlainNetworkStackHarness {
            transport,
            channel,
        })
    }
}

impl NetworkStackHarness for PlainNetworkStackHarness {
    fn transport(&self) -> &Arc<MessageTransport> {
        &self.transport
    }

    fn channel(&self) -> &Arc<MessageChannel> {
        &self.channel
    }
}

/// Server side factory. Every newly created harness is handed to the application through the
///  receiver returned by [PlainNetworkStackHarnessFactory::new].
pub struct PlainNetworkStackHarnessFactory {
    queue_size: usize,
    new_stacks: mpsc::UnboundedSender<Arc<dyn NetworkStackHarness>>,
}

impl PlainNetworkStackHarnessFactory {
    pub fn new(queue_size: usize) -> (PlainNetworkStackHarnessFactory, mpsc::UnboundedReceiver<Arc<dyn NetworkStackHarness>>) {
        let (new_stacks, new_stacks_recv) = mpsc::unbounded_channel();
        let factory = PlainNetworkStackHarnessFactory {
            queue_size,
            new_stacks,
        };
        (factory, new_stacks_recv)
    }
}

impl NetworkStackHarnessFactory for PlainNetworkStackHarnessFactory {
    fn create_harness(&self, transport: Arc<MessageTransport>) -> Arc<dyn NetworkStackHarness> {
        let harness: Arc<dyn NetworkStackHarness> = PlainNetworkStackHarness::new(transport, self.queue_size);
        if self.new_stacks.send(harness.clone()).is_err() {
            debug!("nobody is listening for new stacks");
        }
        harness
    }
}
