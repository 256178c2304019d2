//! Capability tokens for cross-process metadata access.

use crate::error::{Error, Result};
use crate::id::BufferId;
use rustix::rand::GetRandomFlags;

/// Size of an encoded [`AccessToken`].
pub const TOKEN_WIRE_SIZE: usize = 16;

/// Capability that lets another process look up and clone one buffer.
///
/// Tokens are minted by the owning process and handed over through whatever
/// IPC channel the application uses. Revoking access invalidates every token
/// minted before the revoke.
///
/// # Example
///
/// ```rust,ignore
/// let token = surface.create_access_token()?;
/// channel.send(&token.to_bytes())?;
///
/// // In the peer process:
/// let token = AccessToken::from_bytes(&received)?;
/// let surface = BufferAllocator::global()?.lookup_with_token(&token)?;
/// ```
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize,
)]
pub struct AccessToken {
    buffer_id: BufferId,
    secret: u64,
    generation: u32,
}

impl AccessToken {
    pub(crate) fn new(buffer_id: BufferId, secret: u64, generation: u32) -> Self {
        Self {
            buffer_id,
            secret,
            generation,
        }
    }

    /// Buffer this token grants access to.
    #[inline]
    pub fn buffer_id(&self) -> BufferId {
        self.buffer_id
    }

    /// Revocation generation the token was minted in.
    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    #[inline]
    pub(crate) fn secret(&self) -> u64 {
        self.secret
    }

    /// Encode as 16 little-endian bytes: id, secret, generation.
    pub fn to_bytes(&self) -> [u8; TOKEN_WIRE_SIZE] {
        let mut out = [0u8; TOKEN_WIRE_SIZE];
        out[0..4].copy_from_slice(&self.buffer_id.as_raw().to_le_bytes());
        out[4..12].copy_from_slice(&self.secret.to_le_bytes());
        out[12..16].copy_from_slice(&self.generation.to_le_bytes());
        out
    }

    /// Decode the format written by [`AccessToken::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let bytes: &[u8; TOKEN_WIRE_SIZE] = bytes.try_into().map_err(|_| {
            Error::BadArgument(format!(
                "access token must be {TOKEN_WIRE_SIZE} bytes, got {}",
                bytes.len()
            ))
        })?;

        let raw_id = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let buffer_id = BufferId::new(raw_id)
            .ok_or_else(|| Error::BadArgument(format!("reserved buffer id {raw_id:#x} in token")))?;
        let mut secret = [0u8; 8];
        secret.copy_from_slice(&bytes[4..12]);
        let generation = u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);

        Ok(Self::new(buffer_id, u64::from_le_bytes(secret), generation))
    }
}

// The secret stays out of logs.
impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("buffer_id", &self.buffer_id)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// Fresh 64-bit secret from the kernel CSPRNG.
pub(crate) fn fresh_secret() -> Result<u64> {
    let mut buf = [0u8; 8];
    let mut filled = 0;
    while filled < buf.len() {
        match rustix::rand::getrandom(&mut buf[filled..], GetRandomFlags::empty()) {
            Ok(n) => filled += n,
            Err(rustix::io::Errno::INTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(u64::from_ne_bytes(buf))
}
