//! Long-lived secrets provisioned once at token initialization.

use std::fmt;

use zeroize::Zeroizing;

use crate::{Identifier, PreSharedKey, TokenError, IDENTIFIER_BYTES, KEY_BYTES, PROVISIONING_BYTES};

/// Immutable provisioning record: pre-shared key and identifier.
#[derive(Clone)]
pub struct ProvisioningRecord {
    psk: PreSharedKey,
    identifier: Identifier,
}

impl ProvisioningRecord {
    pub fn new(psk: PreSharedKey, identifier: Identifier) -> Self {
        Self { psk, identifier }
    }

    /// Parse the parameter block `psk[16] ‖ id[16]`. Trailing bytes are ignored.
    pub fn from_params(params: &[u8]) -> Result<Self, TokenError> {
        if params.len() < PROVISIONING_BYTES {
            return Err(TokenError::ProvisioningDataTooShort {
                actual: params.len(),
            });
        }
        let mut key = Zeroizing::new([0u8; KEY_BYTES]);
        key.copy_from_slice(&params[..KEY_BYTES]);
        let mut id = Zeroizing::new([0u8; IDENTIFIER_BYTES]);
        id.copy_from_slice(&params[KEY_BYTES..PROVISIONING_BYTES]);
        Ok(Self {
            psk: PreSharedKey::new(*key),
            identifier: Identifier::new(*id),
        })
    }

    /// Parse an installer envelope
    /// `[Li][instance AID][Lc][control info][La][applet data]` and provision from the applet
    /// data section.
    pub fn from_install_data(install: &[u8]) -> Result<Self, TokenError> {
        let truncated = || TokenError::ProvisioningDataTooShort {
            actual: install.len(),
        };
        let mut cursor = 0usize;
        let aid_len = *install.get(cursor).ok_or_else(truncated)? as usize;
        cursor += 1 + aid_len;
        let control_len = *install.get(cursor).ok_or_else(truncated)? as usize;
        cursor += 1 + control_len;
        let data_len = *install.get(cursor).ok_or_else(truncated)? as usize;
        cursor += 1;
        let data = install
            .get(cursor..cursor + data_len)
            .ok_or_else(truncated)?;
        Self::from_params(data)
    }

    pub fn psk(&self) -> &PreSharedKey {
        &self.psk
    }

    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }
}

impl fmt::Debug for ProvisioningRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisioningRecord")
            .field("psk", &self.psk)
            .field("identifier", &self.identifier)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PSK: [u8; 16] = [
        0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE,
        0xFF,
    ];
    const ID: [u8; 16] = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1];

    fn params() -> Vec<u8> {
        [PSK.as_slice(), ID.as_slice()].concat()
    }

    #[test]
    fn splits_key_then_identifier() {
        let record = ProvisioningRecord::from_params(&params()).unwrap();
        assert_eq!(record.psk().secret().expose(), &PSK);
        assert_eq!(record.identifier().expose(), &ID);
    }

    #[test]
    fn short_block_is_rejected() {
        let err = ProvisioningRecord::from_params(&params()[..31]).unwrap_err();
        assert_eq!(err, TokenError::ProvisioningDataTooShort { actual: 31 });
        assert!(ProvisioningRecord::from_params(&[]).is_err());
    }

    #[test]
    fn trailing_bytes_are_ignored() {
        let mut long = params();
        long.extend_from_slice(&[0xFF; 8]);
        let record = ProvisioningRecord::from_params(&long).unwrap();
        assert_eq!(record.identifier().expose(), &ID);
    }

    #[test]
    fn install_envelope_without_aid_or_control_info() {
        let mut install = vec![0x00, 0x00, 0x20];
        install.extend_from_slice(&params());
        let record = ProvisioningRecord::from_install_data(&install).unwrap();
        assert_eq!(record.psk().secret().expose(), &PSK);
        assert_eq!(record.identifier().expose(), &ID);
    }

    #[test]
    fn install_envelope_skips_aid_and_control_info() {
        let aid = [0xF0, 0x00, 0x00, 0x0C, 0xDC, 0x01];
        let mut install = vec![aid.len() as u8];
        install.extend_from_slice(&aid);
        install.extend_from_slice(&[0x02, 0xC9, 0x00]);
        install.push(0x20);
        install.extend_from_slice(&params());
        let record = ProvisioningRecord::from_install_data(&install).unwrap();
        assert_eq!(record.identifier().expose(), &ID);
    }

    #[test]
    fn truncated_install_envelope_is_rejected() {
        let mut install = vec![0x00, 0x00, 0x20];
        install.extend_from_slice(&params()[..20]);
        assert!(matches!(
            ProvisioningRecord::from_install_data(&install),
            Err(TokenError::ProvisioningDataTooShort { .. })
        ));
        assert!(ProvisioningRecord::from_install_data(&[0x05, 0x01]).is_err());

        let mut short_data = vec![0x00, 0x00, 0x10];
        short_data.extend_from_slice(&params()[..16]);
        assert_eq!(
            ProvisioningRecord::from_install_data(&short_data).unwrap_err(),
            TokenError::ProvisioningDataTooShort { actual: 16 }
        );
    }

    #[test]
    fn debug_hides_material() {
        let record = ProvisioningRecord::from_params(&params()).unwrap();
        let rendered = format!("{record:?}");
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains("170"));
    }
}
