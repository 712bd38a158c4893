//! chdr-transport: moves CHDR packets between host and device.
//!
//! Layers, bottom-up: frame pools ([`buffer`]), links ([`dma`], [`udp`])
//! behind the [`link::Link`] trait, frame-size negotiation ([`negotiate`],
//! [`mtu`]), flow control ([`flow`]), register access and device claim
//! ([`ctrl`], [`claim`]), packet transports and streams ([`stream`]), and
//! the [`session::TransportSession`] that wires them together.
//!
//! [`sim`] provides an in-process kernel proxy, register bank and
//! networked device for tests and dry runs.

pub mod buffer;
pub mod claim;
pub mod ctrl;
pub mod dma;
pub mod error;
pub mod flow;
pub mod link;
pub mod mtu;
pub mod negotiate;
pub mod proxy;
pub mod session;
pub mod sim;
pub mod stream;
pub mod udp;

pub use buffer::{FrameBuffer, FramePool};
pub use claim::{ClaimHeartbeat, ClaimPolicy, ClaimStatus};
pub use ctrl::{FwCtrl, RegisterIface};
pub use error::{ErrorClass, TransportError, TransportResult};
pub use flow::{FlowControlPolicy, FlowControlUnits, RxFlowControl, StreamBuffParams, TxFlowControl, XferCounts};
pub use link::{Link, LinkKind, LinkParams, LinkPurpose};
pub use negotiate::LinkHints;
pub use session::{SessionOptions, TransportSession, UdpDeviceAddr};
pub use stream::{ChdrTransport, RxStream, TxStream};
