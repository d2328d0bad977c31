//! A channel backed sink for the observability records of a node.
//!
//! The [`ChannelRecorder`] half is handed to the decision core and never blocks a round. The
//! [`RecordService`] half drains the records on its own task and writes them to the log.

use nebula_core::record::{Record, Recorder};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info};

/// The sending half of the record channel.
#[derive(Clone, Debug)]
pub struct ChannelRecorder {
    sender: UnboundedSender<Record>,
}

impl Recorder for ChannelRecorder {
    fn record(&self, record: Record) {
        // the service is gone during shutdown, records are dropped then
        if let Err(err) = self.sender.send(record) {
            debug!("dropping record: {}", err.0);
        }
    }
}

/// The receiving half of the record channel.
pub struct RecordService {
    receiver: UnboundedReceiver<Record>,
}

impl RecordService {
    /// Creates a new record service and the recorder that feeds it.
    pub fn new() -> (Self, ChannelRecorder) {
        let (sender, receiver) = unbounded_channel();
        (Self { receiver }, ChannelRecorder { sender })
    }
}

/// Writes the records to the log until every recorder is dropped.
///
/// Returns the number of handled records.
pub async fn run_recorder_service(mut service: RecordService) -> u64 {
    let mut handled = 0;
    while let Some(record) = service.receiver.recv().await {
        info!(round = record.round, "{}: {}", record.tag, record.payload);
        handled += 1;
    }
    handled
}
