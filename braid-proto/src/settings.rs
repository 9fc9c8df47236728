use std::{
    collections::HashMap,
    fmt::Debug,
    ops::{Deref, DerefMut},
};

use bytes::{Buf, BufMut};

use thiserror::Error;

use super::{Frame, StreamUni, VarInt};

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Setting(pub VarInt);

impl Setting {
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, SettingsError> {
        Ok(Setting(
            VarInt::decode(buf).map_err(|_| SettingsError::InvalidSize)?,
        ))
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        self.0.encode(buf)
    }

    // Reference: https://datatracker.ietf.org/doc/html/rfc9114#section-7.2.4.1
    pub fn is_grease(&self) -> bool {
        let val = self.0.into_inner();
        if val < 0x21 {
            return false;
        }

        (val - 0x21) % 0x1f == 0
    }
}

impl Debug for Setting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Setting::QPACK_MAX_TABLE_CAPACITY => write!(f, "QPACK_MAX_TABLE_CAPACITY"),
            Setting::MAX_FIELD_SECTION_SIZE => write!(f, "MAX_FIELD_SECTION_SIZE"),
            Setting::QPACK_BLOCKED_STREAMS => write!(f, "QPACK_BLOCKED_STREAMS"),
            Setting::ENABLE_CONNECT_PROTOCOL => write!(f, "ENABLE_CONNECT_PROTOCOL"),
            Setting::ENABLE_DATAGRAM => write!(f, "ENABLE_DATAGRAM"),
            x if x.is_grease() => write!(f, "GREASE SETTING [{:x?}]", x.0.into_inner()),
            x => write!(f, "UNKNOWN_SETTING [{:x?}]", x.0.into_inner()),
        }
    }
}

macro_rules! settings {
    {$($name:ident = $val:expr,)*} => {
        impl Setting {
            $(pub const $name: Setting = Setting(VarInt::from_u32($val));)*
        }
    }
}

settings! {
    QPACK_MAX_TABLE_CAPACITY = 0x1, // default is 0, which disables the QPACK dynamic table
    MAX_FIELD_SECTION_SIZE = 0x6,
    QPACK_BLOCKED_STREAMS = 0x7,
    ENABLE_CONNECT_PROTOCOL = 0x8,
    ENABLE_DATAGRAM = 0x33,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SettingsError {
    /// A setting id or value was cut off; retrying won't help because the
    /// enclosing frame was already complete.
    #[error("invalid size")]
    InvalidSize,
}

/// A map of settings to values.
#[derive(Default, Debug, Clone)]
pub struct Settings(HashMap<Setting, VarInt>);

impl Settings {
    /// Decode the payload of a SETTINGS frame.
    ///
    /// GREASE settings are skipped; unknown settings are kept so callers can
    /// inspect them.
    pub fn decode<B: Buf>(data: &mut B) -> Result<Self, SettingsError> {
        let mut settings = Settings::default();
        while data.has_remaining() {
            // These return a different error because retrying won't help.
            let id = Setting::decode(data)?;
            let value = VarInt::decode(data).map_err(|_| SettingsError::InvalidSize)?;
            if !id.is_grease() {
                settings.0.insert(id, value);
            }
        }

        Ok(settings)
    }

    /// Encode the SETTINGS frame, payload and header both.
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        // Encode to a temporary buffer so we can learn the length.
        let mut tmp = Vec::new();
        for (id, value) in &self.0 {
            id.encode(&mut tmp);
            value.encode(&mut tmp);
        }

        Frame::SETTINGS.write(&tmp, buf);
    }

    /// Encode the control stream preamble: stream type then SETTINGS.
    pub fn encode_control<B: BufMut>(&self, buf: &mut B) {
        StreamUni::CONTROL.encode(buf);
        self.encode(buf);
    }

    /// The peer's cap on a serialized field section, if it advertised one.
    pub fn max_field_section_size(&self) -> Option<u64> {
        self.get(&Setting::MAX_FIELD_SECTION_SIZE)
            .map(|v| v.into_inner())
    }
}

impl Deref for Settings {
    type Target = HashMap<Setting, VarInt>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Settings {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
