use sha2::{Digest, Sha256};

/// Maps application topics to the channel names a backend actually uses.
///
/// An optional prefix lets several applications share one broker. Backends
/// with a length limit (postgres identifiers stop at 63 bytes) get a stable
/// digest instead of a name they would truncate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelNaming {
    prefix: Option<String>,
    max_len: Option<usize>,
}

const DIGEST_LEN: usize = 40;

impl ChannelNaming {
    pub fn new(prefix: Option<String>) -> Self {
        Self {
            prefix: prefix.filter(|p| !p.is_empty()),
            max_len: None,
        }
    }

    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = Some(max_len);
        self
    }

    pub fn channel_for(&self, topic: &str) -> String {
        let name = match &self.prefix {
            Some(prefix) => format!("{prefix}:{topic}"),
            None => topic.to_string(),
        };
        match self.max_len {
            Some(max) if name.len() > max => {
                let digest = format!("{:x}", Sha256::digest(name.as_bytes()));
                digest[..DIGEST_LEN.min(max)].to_string()
            }
            _ => name,
        }
    }
}
