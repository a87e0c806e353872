//! Byte-signature scanning over loaded modules.

use std::str::FromStr;

use nativebridge_intercept::module;

use crate::error::BridgeError;

/// Byte that stands for "any byte" in escaped gamedata signatures.
const ESCAPED_WILDCARD: u8 = 0x2A;

/// A byte pattern where `None` matches any byte.
///
/// Two textual forms are accepted:
/// - escaped, as found in gamedata files: `\x55\x48\x2A\x89` (`\x2A` is a wildcard)
/// - spaced hex: `55 48 ? 89` (`?` or `??` is a wildcard)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BytePattern {
    bytes: Vec<Option<u8>>,
}

impl FromStr for BytePattern {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || BridgeError::InvalidSignature(s.to_string());
        let trimmed = s.trim();

        let bytes = if trimmed.starts_with("\\x") {
            trimmed
                .split("\\x")
                .skip(1)
                .map(|hex| {
                    let byte = u8::from_str_radix(hex, 16).map_err(|_| invalid())?;
                    Ok((byte != ESCAPED_WILDCARD).then_some(byte))
                })
                .collect::<Result<Vec<_>, _>>()?
        } else {
            trimmed
                .split_whitespace()
                .map(|token| match token {
                    "?" | "??" => Ok(None),
                    hex if hex.len() == 2 => u8::from_str_radix(hex, 16).map(Some).map_err(|_| invalid()),
                    _ => Err(invalid()),
                })
                .collect::<Result<Vec<_>, _>>()?
        };

        if bytes.is_empty() {
            return Err(invalid());
        }
        Ok(Self { bytes })
    }
}

impl BytePattern {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn matches_at(&self, window: &[u8]) -> bool {
        self.bytes
            .iter()
            .zip(window)
            .all(|(want, have)| want.is_none_or(|b| b == *have))
    }

    /// Offset of the first match in `haystack`.
    pub fn find(&self, haystack: &[u8]) -> Option<usize> {
        if haystack.len() < self.bytes.len() {
            return None;
        }
        haystack
            .windows(self.bytes.len())
            .position(|window| self.matches_at(window))
    }

    /// Address of the first match inside the readable segments of the loaded
    /// module `module_name`.
    pub fn find_in_module(&self, module_name: &str) -> Result<usize, BridgeError> {
        let module = module::find_module_by_name(module_name)
            .ok_or_else(|| BridgeError::ModuleNotFound(module_name.to_string()))?;

        for &(start, len) in &module.segments {
            // SAFETY: readable PT_LOAD segments stay mapped while the module is loaded.
            let bytes = unsafe { core::slice::from_raw_parts(start as *const u8, len) };
            if let Some(offset) = self.find(bytes) {
                log::debug!("signature found in {} at {:#x}", module.name, start + offset);
                return Ok(start + offset);
            }
        }

        Err(BridgeError::SignatureNotFound(module_name.to_string()))
    }
}
