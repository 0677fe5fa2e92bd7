//! Encryption schemes and wire-format version codes

use crate::error::EncryptionError;

/// Record fields an encryption scheme may cover, packed as a bitmap.
/// Bit 0 is the record value, bit 1 the header values; the same bitmap is
/// serialized into the parcel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecordFieldSet(u16);

impl RecordFieldSet {
    pub const RECORD_VALUE: u16 = 1 << 0;
    pub const RECORD_HEADER_VALUES: u16 = 1 << 1;

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn value_only() -> Self {
        Self(Self::RECORD_VALUE)
    }

    pub fn value_and_headers() -> Self {
        Self(Self::RECORD_VALUE | Self::RECORD_HEADER_VALUES)
    }

    pub fn from_bits(bits: u16) -> Result<Self, EncryptionError> {
        if bits & !(Self::RECORD_VALUE | Self::RECORD_HEADER_VALUES) != 0 {
            return Err(EncryptionError::Truncated(format!(
                "unknown record field bits {bits:#06x}"
            )));
        }
        Ok(Self(bits))
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn contains(self, field: u16) -> bool {
        self.0 & field != 0
    }

    pub fn with(mut self, field: u16) -> Self {
        self.0 |= field;
        self
    }
}

/// What to encrypt and under which KEK
#[derive(Debug, Clone)]
pub struct EncryptionScheme<K> {
    pub kek_id: K,
    pub record_fields: RecordFieldSet,
}

impl<K> EncryptionScheme<K> {
    pub fn new(kek_id: K, record_fields: RecordFieldSet) -> Self {
        Self {
            kek_id,
            record_fields,
        }
    }
}

/// The version byte carried in the encryption record header. It pins both
/// the parcel and the wrapper layout a reader must expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionVersion {
    V1,
}

impl EncryptionVersion {
    pub fn code(self) -> u8 {
        match self {
            EncryptionVersion::V1 => 1,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, EncryptionError> {
        match code {
            1 => Ok(EncryptionVersion::V1),
            other => Err(EncryptionError::UnknownEncryptionVersion(other)),
        }
    }

    pub fn parcel_version(self) -> ParcelVersion {
        match self {
            EncryptionVersion::V1 => ParcelVersion::V1,
        }
    }

    pub fn wrapper_version(self) -> WrapperVersion {
        match self {
            EncryptionVersion::V1 => WrapperVersion::V1,
        }
    }
}

/// Parcel layout version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParcelVersion {
    V1,
}

impl ParcelVersion {
    pub fn code(self) -> u8 {
        match self {
            ParcelVersion::V1 => 1,
        }
    }
}

/// Wrapper layout version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrapperVersion {
    V1,
}

/// Additional authenticated data selector. V1 reserves the code space;
/// only `None` is defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AadSpec {
    None,
}

impl AadSpec {
    pub fn code(self) -> u8 {
        match self {
            AadSpec::None => 0,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, EncryptionError> {
        match code {
            0 => Ok(AadSpec::None),
            other => Err(EncryptionError::UnknownAad(other)),
        }
    }

    pub fn bytes(self) -> &'static [u8] {
        &[]
    }
}

/// Cipher selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherCode {
    /// AES-GCM with a 96-bit IV and 128-bit tag
    AesGcm96_128,
}

impl CipherCode {
    pub fn code(self) -> u8 {
        match self {
            CipherCode::AesGcm96_128 => 0,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, EncryptionError> {
        match code {
            0 => Ok(CipherCode::AesGcm96_128),
            other => Err(EncryptionError::UnknownCipher(other)),
        }
    }
}
