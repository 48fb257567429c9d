#![no_main]

use libfuzzer_sys::fuzz_target;

use aerospike_core::msgpack::unpack_value;
use aerospike_core::serialization::BufferReader;
use aerospike_core::Value;

fuzz_target!(|data: &[u8]| {
    let mut input = BufferReader::new(data);
    while input.remaining() > 0 {
        if unpack_value(&mut input).is_err() {
            break;
        }
    }

    for ptype in [1u8, 2, 3, 19, 20, 23] {
        let _ = Value::from_particle(ptype, data);
    }
});
