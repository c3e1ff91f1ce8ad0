//! Profile identities and UUID helpers.

use std::collections::HashMap;

use bt_sal::types::Uuid;

/// Profile services known to the framework. Only GATT client/server and
/// SPP are implemented here; the remaining identifiers exist so the power
/// manager can classify link activity reported for them.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Profile {
    A2dp,
    AvrcpCt,
    AvrcpTg,
    Gattc,
    Gatts,
    HfpAg,
    HfpHf,
    HidDev,
    Panu,
    Spp,
}

pub struct UuidHelper {}

impl UuidHelper {
    /// The service-class UUID a profile registers under, where one exists.
    pub fn get_profile_uuid(profile: &Profile) -> Option<Uuid> {
        lazy_profile_map().get(profile).cloned()
    }

    pub fn is_known_profile(uuid: &Uuid) -> Option<Profile> {
        lazy_profile_map().iter().find(|(_, uu)| *uu == uuid).map(|(p, _)| *p)
    }
}

fn lazy_profile_map() -> HashMap<Profile, Uuid> {
    [
        (Profile::Spp, Uuid::from_u16(0x1101)),
        (Profile::A2dp, Uuid::from_u16(0x110b)),
        (Profile::AvrcpCt, Uuid::from_u16(0x110e)),
        (Profile::AvrcpTg, Uuid::from_u16(0x110c)),
        (Profile::HfpHf, Uuid::from_u16(0x111e)),
        (Profile::HfpAg, Uuid::from_u16(0x111f)),
        (Profile::Panu, Uuid::from_u16(0x1115)),
        (Profile::HidDev, Uuid::from_u16(0x1124)),
        (Profile::Gattc, Uuid::from_u16(0x1801)),
        (Profile::Gatts, Uuid::from_u16(0x1801)),
    ]
    .iter()
    .cloned()
    .collect()
}
