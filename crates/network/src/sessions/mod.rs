pub mod inbound;
pub mod outbound;
pub mod seed;
pub mod session;

pub use inbound::SessionInbound;
pub use outbound::SessionOutbound;
pub use seed::SessionSeed;
pub use session::{PendingNonces, Session, SessionKind};
