use honggfuzz::fuzz;
use paywall_indexerd::payload::{decode_script, op_return_data, Payload};

fn main() {
    loop {
        fuzz!(|data: &[u8]| {
            // Whatever the output script, we must never panic on it.
            let from_script = decode_script(data);
            if let Some(pushed) = op_return_data(data) {
                assert_eq!(from_script, Payload::decode(pushed));
            } else {
                assert!(from_script.is_none());
            }

            let payload = match Payload::decode(data) {
                Some(payload) => payload,
                None => {
                    assert!(data.len() < 14);
                    return;
                }
            };
            assert_eq!(payload.encode(), data);
            if data.len() <= 255 {
                let script = payload.op_return_script().unwrap();
                assert_eq!(decode_script(&script), Some(payload));
            }
        });
    }
}
