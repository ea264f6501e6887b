//! Integration tests for device events
//!
//! Checks the JSON shape consumers of the event stream see and the topic
//! names published for each event.

use protocol::{DeviceEvent, DeviceKey, DeviceRecord, Direction, QueryError};

fn teensy() -> DeviceRecord {
    DeviceRecord {
        location_id: 0x1410_0000,
        vendor_id: 5824,
        product_id: 1155,
        device_name: "Teensy USB Serial".to_string(),
        manufacturer: "PJRC.COM, LLC.".to_string(),
        serial_number: "12345".to_string(),
        device_address: 11,
    }
}

mod json {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let value = serde_json::to_value(DeviceEvent::added(teensy())).unwrap();

        assert_eq!(value["direction"], "added");
        assert_eq!(value["record"]["locationId"], 0x1410_0000);
        assert_eq!(value["record"]["deviceName"], "Teensy USB Serial");
        assert_eq!(value["record"]["deviceAddress"], 11);
    }

    #[test]
    fn test_event_from_json() {
        let json = r#"{
            "direction": "removed",
            "record": {
                "locationId": 0,
                "vendorId": 1256,
                "productId": 20539,
                "deviceName": "",
                "manufacturer": "",
                "serialNumber": "",
                "deviceAddress": 0
            }
        }"#;

        let event: DeviceEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.direction, Direction::Removed);
        assert_eq!(event.record, DeviceRecord::with_ids(0x04e8, 0x503b));
    }

    #[test]
    fn test_key_is_plain_string() {
        let key = DeviceKey::new("usb-1-2.3");
        assert_eq!(serde_json::to_string(&key).unwrap(), r#""usb-1-2.3""#);
    }
}

mod topics {
    use super::*;

    #[test]
    fn test_add_topic_family() {
        let topics = DeviceEvent::added(teensy()).topics();
        assert_eq!(
            topics,
            vec![
                "add:5824:1155",
                "insert:5824:1155",
                "add:5824",
                "insert:5824",
                "add",
                "insert",
                "change:5824:1155",
                "change:5824",
                "change",
            ]
        );
    }

    #[test]
    fn test_remove_of_empty_record() {
        let event = DeviceEvent::removed(DeviceRecord::default());
        assert!(!event.is_added());
        assert_eq!(event.topics()[0], "remove:0:0");
    }
}

#[test]
fn test_query_error_is_comparable() {
    let err = QueryError::Failed("boom".to_string());
    assert_eq!(err.clone(), err);
    assert_eq!(err.to_string(), "Query failed: boom");
}
