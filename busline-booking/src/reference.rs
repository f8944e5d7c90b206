use busline_core::booking::OrderRef;
use busline_core::CoreResult;
use rand::Rng;

// No 0/O or 1/I, references get read out over the phone.
const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const CODE_LEN: usize = 6;

/// Server-side order reference, e.g. `RT-7KQ2XM`.
pub fn generate_order_ref() -> CoreResult<OrderRef> {
    let mut rng = rand::thread_rng();
    let code: String = (0..CODE_LEN)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    OrderRef::parse(&format!("RT-{}", code))
}
