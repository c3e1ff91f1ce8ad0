//! Build-time tunables of the framework, with the same defaults the
//! reference configuration ships.

#[derive(Debug, Clone)]
pub struct Config {
    /// Compile-level BLE support switch.
    pub ble_support: bool,
    /// Compile-level BR/EDR support switch.
    pub bredr_support: bool,
    /// LE advertising manager enabled.
    pub ble_adv: bool,
    /// LE scan manager enabled.
    pub ble_scan: bool,
    /// GATT client slot table size.
    pub gattc_max_connections: u32,
    /// Default maximum attributes per server table.
    pub gatts_max_attribute_num: usize,
    /// Advertiser slot table size.
    pub le_advertiser_max_num: u32,
    /// Scanner slot table size.
    pub le_scanner_max_num: u32,
    /// Power-manager timer pool size.
    pub pm_max_timer_number: usize,
    /// Callback-registry capacity.
    pub max_register_num: usize,
    /// HCI packet capture directory; None disables the capture.
    pub snoop_log_path: Option<String>,
    /// BR/EDR ACL admission cap.
    pub max_acl_connections: usize,
    /// Directory holding the persistent adapter/bond records.
    pub storage_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ble_support: true,
            bredr_support: true,
            ble_adv: true,
            ble_scan: true,
            gattc_max_connections: 4,
            gatts_max_attribute_num: 16,
            le_advertiser_max_num: 2,
            le_scanner_max_num: 2,
            pm_max_timer_number: 4,
            max_register_num: 8,
            snoop_log_path: None,
            max_acl_connections: 10,
            storage_path: "/data/misc/bt".into(),
        }
    }
}
