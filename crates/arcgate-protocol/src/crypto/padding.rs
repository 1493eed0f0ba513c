//! Block padding for CBC.

use crate::ProtocolError;

wire_enum! {
    /// Padding scheme applied before block encryption.
    pub enum PaddingMode {
        #[default]
        None = 0,
        /// Every pad byte holds the pad length.
        Pkcs7 = 1,
        /// Zero bytes followed by a final length byte.
        X923 = 2,
    }
}

impl PaddingMode {
    /// Pads `buf` to a multiple of `block` in place.
    ///
    /// A full block is added when the input is already aligned, so the
    /// pad is always removable. With `None` the input must already be
    /// aligned.
    pub fn pad(self, buf: &mut Vec<u8>, block: usize) -> Result<(), ProtocolError> {
        let n = block - buf.len() % block;
        match self {
            Self::None if n == block => Ok(()),
            Self::None => Err(ProtocolError::Encrypt(format!(
                "{} bytes not aligned to block size {block}",
                buf.len()
            ))),
            Self::Pkcs7 => {
                buf.resize(buf.len() + n, n as u8);
                Ok(())
            }
            Self::X923 => {
                buf.resize(buf.len() + n - 1, 0);
                buf.push(n as u8);
                Ok(())
            }
        }
    }

    /// Strips the padding added by [`pad`](Self::pad).
    pub fn unpad(self, buf: &mut Vec<u8>, block: usize) -> Result<(), ProtocolError> {
        if self == Self::None {
            return Ok(());
        }
        let bad = || ProtocolError::Decrypt("invalid padding".into());
        let n = *buf.last().ok_or_else(bad)? as usize;
        if n == 0 || n > block || n > buf.len() {
            return Err(bad());
        }
        let body = buf.len() - n;
        let fill = &buf[body..buf.len() - 1];
        let valid = match self {
            Self::Pkcs7 => fill.iter().all(|&b| b as usize == n),
            Self::X923 => fill.iter().all(|&b| b == 0),
            Self::None => true,
        };
        if !valid {
            return Err(bad());
        }
        buf.truncate(body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pkcs7_pads_to_block_and_strips() {
        let mut buf = vec![1, 2, 3];
        PaddingMode::Pkcs7.pad(&mut buf, 8).unwrap();
        assert_eq!(buf, vec![1, 2, 3, 5, 5, 5, 5, 5]);
        PaddingMode::Pkcs7.unpad(&mut buf, 8).unwrap();
        assert_eq!(buf, vec![1, 2, 3]);
    }

    #[test]
    fn test_aligned_input_gets_full_pad_block() {
        let mut buf = vec![9; 16];
        PaddingMode::X923.pad(&mut buf, 16).unwrap();
        assert_eq!(buf.len(), 32);
        assert_eq!(buf[31], 16);
        assert!(buf[16..31].iter().all(|&b| b == 0));
        PaddingMode::X923.unpad(&mut buf, 16).unwrap();
        assert_eq!(buf, vec![9; 16]);
    }

    #[test]
    fn test_unpad_rejects_corrupt_pad() {
        let mut buf = vec![1, 2, 3, 4, 4, 9, 4, 4];
        assert!(PaddingMode::Pkcs7.unpad(&mut buf, 8).is_err());
        let mut buf = vec![1, 2, 3, 4, 0, 0, 0, 0];
        assert!(PaddingMode::X923.unpad(&mut buf, 8).is_err());
    }

    #[test]
    fn test_none_requires_alignment() {
        let mut buf = vec![0; 5];
        assert!(PaddingMode::None.pad(&mut buf, 16).is_err());
        let mut buf = vec![0; 16];
        assert!(PaddingMode::None.pad(&mut buf, 16).is_ok());
        assert_eq!(buf.len(), 16);
    }
}
