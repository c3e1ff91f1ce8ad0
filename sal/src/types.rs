//! Wire-level types shared by the SAL traits and the framework service.

use std::fmt::{Debug, Display, Formatter, Result as FmtResult};

use num_derive::{FromPrimitive, ToPrimitive};

/// Status taxonomy returned by every SAL call and carried in completion
/// events. Synchronous API calls hand it to the application verbatim.
#[derive(Debug, Copy, Clone, Eq, PartialEq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum BtStatus {
    Success = 0,
    Fail,
    NotReady,
    NoMem,
    Busy,
    Done,
    Unsupported,
    ParmInvalid,
    Unhandled,
    AuthFailure,
    RmtDevDown,
    AuthRejected,
    UnknownError,
    NotFound,
    DeviceNotFound,
    ServiceNotFound,
    NoResources,
    IpcError,
    PageTimeout,
    RmtDevTerminate,
    LocalTerminated,
}

/// ATT-level status carried in GATT completion events.
#[derive(Debug, Copy, Clone, Eq, PartialEq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum GattStatus {
    Success = 0,
    Failure,
    RequestNotSupported,
    InsufficientAuthentication,
    InsufficientEncryption,
    ReadNotPermitted,
    WriteNotPermitted,
    InvalidAttributeLength,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum BtTransport {
    Bredr = 0,
    Le,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum BleAddrType {
    Public = 0,
    Random,
    PublicId,
    RandomId,
    Anonymous,
    Unknown,
}

impl Default for BleAddrType {
    fn default() -> Self {
        BleAddrType::Public
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum BondState {
    None = 0,
    Bonding,
    Bonded,
    Canceling,
}

/// ACL-level connection state of a device record. The encrypted variants
/// layer on top of `Connected`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting,
    Connected,
    Disconnecting,
    EncryptedBredr,
    EncryptedLe,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connected
                | ConnectionState::EncryptedBredr
                | ConnectionState::EncryptedLe
        )
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(
            self,
            ConnectionState::EncryptedBredr | ConnectionState::EncryptedLe
        )
    }
}

/// Profile-level connection state reported by the GATT SAL.
#[derive(Debug, Copy, Clone, Eq, PartialEq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum ProfileConnectionState {
    Disconnected = 0,
    Connecting,
    Connected,
    Disconnecting,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum BtDeviceType {
    Unknown = 0,
    Bredr = 1,
    Ble = 2,
    Dual = 3,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum BtIoCapability {
    DisplayOnly = 0,
    DisplayYesNo,
    KeyboardOnly,
    NoInputNoOutput,
    KeyboardDisplay,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum BtScanMode {
    None = 0,
    Connectable,
    ConnectableDiscoverable,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BtScanType {
    Standard,
    Interlaced,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum BtDiscoveryState {
    Stopped = 0,
    Started,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum LinkRole {
    Master = 0,
    Slave,
    Unknown,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum LinkMode {
    Active = 0,
    Hold,
    Sniff,
    Park,
}

/// Link policy bits (HCI write-link-policy encoding).
pub const LINK_POLICY_ENABLE_ROLE_SWITCH: u16 = 0x0001;
pub const LINK_POLICY_ENABLE_SNIFF: u16 = 0x0004;

#[derive(Debug, Copy, Clone, Eq, PartialEq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum PairType {
    PinCode = 0,
    PasskeyConfirmation,
    PasskeyEntry,
    PasskeyNotification,
    Consent,
    OobDataRequest,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum LinkKeyType {
    Combination = 0,
    Local,
    Remote,
    DebugCombination,
    UnauthenticatedP192,
    AuthenticatedP192,
    ChangedCombination,
    UnauthenticatedP256,
    AuthenticatedP256,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum BlePhy {
    Le1m = 1,
    Le2m = 2,
    LeCoded = 3,
}

/// HCI disconnect reason used when the local host tears a link down.
pub const HCI_ERR_CONNECTION_TERMINATED_BY_LOCAL_HOST: u8 = 0x16;
/// HCI reject reason for pairing requests the adapter refuses.
pub const HCI_ERR_PAIRING_NOT_ALLOWED: u8 = 0x18;

pub const BT_LOC_NAME_MAX_LEN: usize = 63;
pub const BT_REM_NAME_MAX_LEN: usize = 63;

/// Class-of-device major class test for audio devices; role switch is
/// disabled against headsets when the local side ends up master.
pub fn cod_is_headset(cod: u32) -> bool {
    ((cod >> 8) & 0x1f) == 0x04
}

/// 6-byte public or random device address.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct RawAddress {
    pub address: [u8; 6],
}

impl RawAddress {
    pub const EMPTY: RawAddress = RawAddress { address: [0; 6] };

    pub fn is_empty(&self) -> bool {
        self.address == [0; 6]
    }

    /// Parses "aa:bb:cc:dd:ee:ff".
    pub fn from_string<S: AsRef<str>>(addr: S) -> Option<RawAddress> {
        let mut bytes = [0u8; 6];
        let parts: Vec<&str> = addr.as_ref().split(':').collect();
        if parts.len() != 6 {
            return None;
        }
        for (i, part) in parts.iter().enumerate() {
            bytes[i] = u8::from_str_radix(part, 16).ok()?;
        }
        Some(RawAddress { address: bytes })
    }
}

impl Display for RawAddress {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.address[0],
            self.address[1],
            self.address[2],
            self.address[3],
            self.address[4],
            self.address[5]
        )
    }
}

impl Debug for RawAddress {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        Display::fmt(self, f)
    }
}

impl From<[u8; 6]> for RawAddress {
    fn from(addr: [u8; 6]) -> Self {
        RawAddress { address: addr }
    }
}

/// Log-friendly wrapper that hides the OUI half of an address.
pub struct DisplayAddress<'a>(pub &'a RawAddress);

impl<'a> Display for DisplayAddress<'a> {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        write!(
            f,
            "xx:xx:xx:{:02x}:{:02x}:{:02x}",
            self.0.address[3], self.0.address[4], self.0.address[5]
        )
    }
}

const BASE_UUID: [u8; 16] = [
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0x80, 0x5f, 0x9b, 0x34,
    0xfb,
];

/// 128-bit UUID stored big-endian. 16- and 32-bit UUIDs are canonicalised
/// onto the Bluetooth base UUID.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct Uuid {
    pub uu: [u8; 16],
}

impl Uuid {
    pub const fn from_bytes(uu: [u8; 16]) -> Self {
        Uuid { uu }
    }

    pub fn from_u16(v: u16) -> Self {
        Uuid::from_u32(v as u32)
    }

    pub fn from_u32(v: u32) -> Self {
        let mut uu = BASE_UUID;
        uu[0..4].copy_from_slice(&v.to_be_bytes());
        Uuid { uu }
    }

    /// The 16-bit alias if this UUID sits on the base UUID, else None.
    pub fn as_u16(&self) -> Option<u16> {
        if self.uu[0] == 0 && self.uu[1] == 0 && self.uu[4..] == BASE_UUID[4..] {
            Some(u16::from_be_bytes([self.uu[2], self.uu[3]]))
        } else {
            None
        }
    }

    /// Parses "00001101-0000-1000-8000-00805f9b34fb".
    pub fn from_string<S: AsRef<str>>(raw: S) -> Option<Uuid> {
        let raw: String = raw.as_ref().chars().filter(|c| *c != '-').collect();
        if raw.len() != 32 {
            return None;
        }
        let mut uu = [0u8; 16];
        for i in 0..16 {
            uu[i] = u8::from_str_radix(&raw[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(Uuid { uu })
    }

    pub fn is_empty(&self) -> bool {
        self.uu == [0; 16]
    }
}

impl Display for Uuid {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        for (i, b) in self.uu.iter().enumerate() {
            if i == 4 || i == 6 || i == 8 || i == 10 {
                write!(f, "-")?;
            }
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl Debug for Uuid {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        Display::fmt(self, f)
    }
}

impl From<[u8; 16]> for Uuid {
    fn from(uu: [u8; 16]) -> Self {
        Uuid { uu }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_round_trip() {
        let addr = RawAddress::from_string("00:01:02:a3:b4:c5").unwrap();
        assert_eq!(addr.address, [0x00, 0x01, 0x02, 0xa3, 0xb4, 0xc5]);
        assert_eq!(addr.to_string(), "00:01:02:a3:b4:c5");
        assert!(RawAddress::from_string("00:01:02").is_none());
        assert!(RawAddress::from_string("zz:01:02:a3:b4:c5").is_none());
    }

    #[test]
    fn test_uuid_canonicalisation() {
        let spp = Uuid::from_u16(0x1101);
        assert_eq!(spp.to_string(), "00001101-0000-1000-8000-00805f9b34fb");
        assert_eq!(spp.as_u16(), Some(0x1101));
        assert_eq!(Uuid::from_string(spp.to_string()), Some(spp));

        let custom = Uuid::from_string("12345678-90ab-cdef-1234-567890abcdef").unwrap();
        assert_eq!(custom.as_u16(), None);
    }

    #[test]
    fn test_headset_cod() {
        // Major class 0x04 (audio/video), minor headset.
        assert!(cod_is_headset(0x240404));
        assert!(!cod_is_headset(0x5a020c));
    }
}
