#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes must never panic the strict decoder.
    let _ = codec::yenc::decode(data);

    // And everything we encode must decode back to itself.
    let framed = codec::yenc::encode(data, "fuzz", codec::DEFAULT_LINE_WIDTH);
    let (decoded, _) = codec::yenc::decode(&framed).expect("own encoding decodes");
    assert_eq!(decoded, data);
});
