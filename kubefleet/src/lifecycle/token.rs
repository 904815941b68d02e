use rand::Rng;

const TOKEN_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

fn random_string(rng: &mut impl Rng, len: usize) -> String {
    (0..len)
        .map(|_| TOKEN_CHARS[rng.random_range(0..TOKEN_CHARS.len())] as char)
        .collect()
}

/// A kubeadm bootstrap token, `[a-z0-9]{6}.[a-z0-9]{16}`.
pub fn bootstrap_token() -> String {
    let mut rng = rand::rng();
    format!(
        "{}.{}",
        random_string(&mut rng, 6),
        random_string(&mut rng, 16)
    )
}

pub fn is_bootstrap_token(token: &str) -> bool {
    let valid = |s: &str, len: usize| {
        s.len() == len && s.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
    };
    match token.split_once('.') {
        Some((id, secret)) => valid(id, 6) && valid(secret, 16),
        None => false,
    }
}
