use blink_decoder::{decode_one, DecodeMode, MAX_INSTRUCTION_LEN};
use proptest::prelude::*;

proptest! {
    /// `decode_one` must never panic and must never report a length longer
    /// than the bytes it was handed, regardless of what garbage bytes it is
    /// fed. This stands in for the decoder-side half of the fetch loop's
    /// robustness contract, since `LoadInstruction` trusts the decoder's
    /// reported length to advance `ip`.
    #[test]
    fn decode_one_never_overruns(bytes in prop::collection::vec(any::<u8>(), 1..32)) {
        if let Ok(decoded) = decode_one(DecodeMode::Bits64, 0x1000, &bytes) {
            prop_assert!(decoded.len() >= 1);
            prop_assert!(decoded.len() <= MAX_INSTRUCTION_LEN);
            prop_assert!(decoded.len() <= bytes.len());
        }
    }
}
