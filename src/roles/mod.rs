mod collector;
mod notifier;
mod processor;
mod storage;

pub use collector::CollectorHandler;
pub use notifier::NotifierHandler;
pub use processor::ProcessorHandler;
pub use storage::StorageHandler;

use network::Request;

/// Wire name of a message, for error responses about unsupported types.
pub(crate) fn message_name(request: &Request) -> &'static str {
    match request {
        Request::Handshake { .. } => "handshake",
        Request::Data { .. } => "data",
        Request::Heartbeat { .. } => "heartbeat",
        Request::StoreData { .. } => "store_data",
        Request::RetrieveData { .. } => "retrieve_data",
        Request::Alert { .. } => "alert",
        Request::Notify { .. } => "notify",
        Request::Subscribe { .. } => "subscribe",
        Request::Replicate { .. } => "replicate",
        Request::VersionInfo => "version_info",
    }
}
