//! Minimal parser for LE advertising (EIR/AD) payloads.
//!
//! Walks the length-tagged AD structures and extracts the fields the scan
//! filters evaluate. Unknown AD types are skipped.

/* AD type tags */
const AD_TYPE_FLAGS: u8 = 0x01;
const AD_TYPE_NAME_SHORT: u8 = 0x08;
const AD_TYPE_NAME_COMPLETE: u8 = 0x09;
const AD_TYPE_TX_POWER: u8 = 0x0a;
const AD_TYPE_SVC_DATA_16: u8 = 0x16;

#[derive(Debug, Clone, Default)]
pub struct ScanRecord {
    pub uuid: u16,
    pub tx_power: i8,
    pub flags: u8,
    pub name: Option<String>,
}

impl ScanRecord {
    pub fn parse(adv_data: &[u8]) -> ScanRecord {
        let mut record = ScanRecord::default();
        let mut data = adv_data;

        while data.len() >= 2 {
            let field_len = data[0] as usize;
            if field_len == 0 || field_len + 1 > data.len() {
                break;
            }

            let ad_type = data[1];
            let payload = &data[2..field_len + 1];

            match ad_type {
                AD_TYPE_SVC_DATA_16 => {
                    if payload.len() >= 2 {
                        record.uuid = u16::from_le_bytes([payload[0], payload[1]]);
                    }
                }
                AD_TYPE_FLAGS => {
                    if !payload.is_empty() {
                        record.flags = payload[0];
                    }
                }
                AD_TYPE_TX_POWER => {
                    if !payload.is_empty() {
                        record.tx_power = payload[0] as i8;
                    }
                }
                AD_TYPE_NAME_SHORT | AD_TYPE_NAME_COMPLETE => {
                    record.name = String::from_utf8(payload.to_vec()).ok();
                }
                _ => {}
            }

            data = &data[field_len + 1..];
        }

        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_service_data_16() {
        // flags(0x06), 16-bit service data for 0x180f with one value byte.
        let adv = [0x02, 0x01, 0x06, 0x04, 0x16, 0x0f, 0x18, 0x64];
        let record = ScanRecord::parse(&adv);
        assert_eq!(record.uuid, 0x180f);
        assert_eq!(record.flags, 0x06);
    }

    #[test]
    fn test_parse_name_and_truncated_field() {
        let adv = [0x05, 0x09, b'd', b'e', b's', b'k', 0x7f, 0x16];
        let record = ScanRecord::parse(&adv);
        assert_eq!(record.name.as_deref(), Some("desk"));
        // The oversized trailing field is ignored.
        assert_eq!(record.uuid, 0);
    }

    #[test]
    fn test_parse_empty() {
        let record = ScanRecord::parse(&[]);
        assert_eq!(record.uuid, 0);
        assert!(record.name.is_none());
    }
}
