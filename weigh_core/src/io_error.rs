//! Maps `Box<dyn Error>` from trait boundaries to typed `AgentError`.
//!
//! The traits in `weigh_traits` use `Box<dyn Error + Send + Sync>` so adapters
//! stay free to return their own errors; this module converts those to our
//! typed enum, with an optional feature-gated path for `weigh_io::IoError`.

use crate::error::AgentError;

/// Which seam the error came from; picks the fallback variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Seam {
    Transport,
    Broker,
    Http,
    Print,
}

pub fn map_io_error(seam: Seam, e: &(dyn std::error::Error + 'static)) -> AgentError {
    #[cfg(feature = "io-errors")]
    {
        if let Some(io) = e.downcast_ref::<weigh_io::IoError>() {
            return match io {
                weigh_io::IoError::Serial(m) => AgentError::Transport(m.clone()),
                weigh_io::IoError::Mqtt(m) => AgentError::Broker(m.clone()),
                weigh_io::IoError::Http(m) | weigh_io::IoError::Status(m) => {
                    AgentError::Http(m.clone())
                }
                weigh_io::IoError::PrintCommand(m) => AgentError::Print(m.clone()),
                other => fallback(seam, other.to_string()),
            };
        }
    }
    fallback(seam, e.to_string())
}

fn fallback(seam: Seam, msg: String) -> AgentError {
    match seam {
        Seam::Transport => AgentError::Transport(msg),
        Seam::Broker => AgentError::Broker(msg),
        Seam::Http => AgentError::Http(msg),
        Seam::Print => AgentError::Print(msg),
    }
}
