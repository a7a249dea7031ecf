use std::time::Duration;

use hyper::header::{HeaderMap, HeaderName, HeaderValue};

use crate::error::OptionsError;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Options applied to every request of the batch. Read-only once the run starts.
#[derive(Debug, Clone)]
pub struct RequestParams {
    pub headers: HeaderMap,
    pub timeout: Duration,
}

impl Default for RequestParams {
    fn default() -> Self {
        Self {
            headers: HeaderMap::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl RequestParams {
    pub fn insert_header(&mut self, name: &str, value: &str) -> Result<(), OptionsError> {
        let invalid = || OptionsError::InvalidHeader(format!("{name}: {value}"));
        let name = HeaderName::from_bytes(name.trim().as_bytes()).map_err(|_| invalid())?;
        let value = HeaderValue::from_str(value.trim()).map_err(|_| invalid())?;
        self.headers.insert(name, value);
        Ok(())
    }

    /// Parses a `Name: value` line as given on the command line.
    pub fn insert_header_line(&mut self, line: &str) -> Result<(), OptionsError> {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| OptionsError::InvalidHeader(line.to_string()))?;
        self.insert_header(name, value)
    }
}
