//! RFCOMM/SPP half of the SAL, used by the sample profile service.

use crate::types::{BtStatus, ProfileConnectionState, RawAddress, Uuid};

pub trait SppSal: Send + Sync {
    fn listen(&self, scn: u8, uuid: &Uuid) -> BtStatus;
    fn unlisten(&self, scn: u8) -> BtStatus;
    fn connect(&self, addr: &RawAddress, scn: u8, uuid: &Uuid) -> BtStatus;
    fn disconnect(&self, addr: &RawAddress, scn: u8) -> BtStatus;
    fn write(&self, addr: &RawAddress, scn: u8, data: &[u8]) -> BtStatus;
}

#[derive(Debug)]
pub enum SppCallbacks {
    ConnectionStateChanged(RawAddress, u8, ProfileConnectionState),
    DataReceived(RawAddress, u8, Vec<u8>),
    /// Remote credits ran out / recovered; true means writable.
    WriteReady(RawAddress, u8, bool),
}

pub struct SppCallbacksDispatcher {
    pub dispatch: Box<dyn Fn(SppCallbacks) + Send>,
}
