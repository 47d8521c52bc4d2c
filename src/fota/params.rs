// Update parameters shared between the trigger path and the FOTA task

use heapless::String;

use super::error::FotaError;

/// Domain names are 255 octets or less (RFC 1035)
pub const MAX_SERVER_NAME_LEN: usize = 255;
pub const MAX_URI_LEN: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FotaParameters {
    /// Domain name or literal IPv4/IPv6 address
    pub server: String<MAX_SERVER_NAME_LEN>,
    pub port: u16,
    /// Location of the co-processor image on the server
    pub uri: String<MAX_URI_LEN>,
}

impl FotaParameters {
    pub fn new(server: &str, port: u16, uri: &str) -> Result<Self, FotaError> {
        Ok(Self {
            server: bounded(server)?,
            port,
            uri: bounded(uri)?,
        })
    }
}

fn bounded<const N: usize>(value: &str) -> Result<String<N>, FotaError> {
    if value.is_empty() {
        return Err(FotaError::InvalidParameter);
    }
    let mut out = String::new();
    out.push_str(value).map_err(|_| {
        log::error!("Parameter too long ({} bytes, max {})", value.len(), N);
        FotaError::InvalidParameter
    })?;
    Ok(out)
}
