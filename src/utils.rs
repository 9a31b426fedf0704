use rand::Rng;

/// Generates a random token of size N bytes, encoded in base58.
pub fn generate_token<const N: usize>(mut rng: impl Rng) -> String {
    let mut token = [0u8; N];
    rng.fill_bytes(&mut token);
    bs58::encode(token).into_string()
}

/// Generates a random base58 id of exactly `len` characters.
pub fn generate_id(len: usize) -> String {
    let mut rng = rand::thread_rng();
    let mut id = String::with_capacity(len);
    while id.len() < len {
        id.push_str(&generate_token::<16>(&mut rng));
    }
    id.truncate(len);
    id
}
