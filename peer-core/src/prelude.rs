pub use std::fmt::{Debug, Display};
pub use std::net::{IpAddr, Ipv4Addr, SocketAddr};
pub use std::sync::{Arc, Mutex};
pub use std::time::{Duration, Instant};

pub use tracing::{debug, error, info, trace, warn};

pub use crate::strng;
pub use crate::strng::Strng;
