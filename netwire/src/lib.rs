pub mod buffer;
pub(crate) mod conn;
pub mod error;
pub mod listener;
pub mod port_utils;
pub mod reactor;
pub mod session;
pub(crate) mod socket;
pub mod task_queue;
pub mod tcp_client;
pub mod tcp_server;
pub mod udp_client;
pub mod udp_server;
#[cfg(unix)]
pub mod unix_client;
#[cfg(unix)]
pub mod unix_server;

// Public API re-exports
pub use buffer::{DataBuffer, POOL_BLOCK_SIZE};
pub use error::Error;
pub use listener::{ClientListener, ServerListener};
pub use port_utils::{get_idle_udp_port, get_idle_udp_port_pair};
pub use reactor::{EventHandler, EventReactor, InterestSet};
pub use session::Session;
pub use socket::INVALID_SOCKET;
pub use task_queue::{MAX_TASK_DELAY, Task, TaskQueue, TaskRunnable};
pub use tcp_client::TcpClient;
pub use tcp_server::TcpServer;
pub use udp_client::UdpClient;
pub use udp_server::UdpServer;
#[cfg(unix)]
pub use unix_client::UnixClient;
#[cfg(unix)]
pub use unix_server::UnixServer;
