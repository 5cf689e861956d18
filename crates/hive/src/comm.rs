pub use crate::internal::transfer::auth::{
    CLIENT_ROLE, SERVER_ROLE, WORKER_ROLE, deserialize, do_authentication,
    forward_queue_to_sealed_sink, open_message, seal_message, serialize,
};
pub use crate::internal::transfer::transport::make_framed;
pub use crate::internal::worker::rpc::connect_to_server_and_authenticate;
