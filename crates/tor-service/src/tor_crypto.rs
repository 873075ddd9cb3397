// standard
use std::convert::TryInto;
use std::str;

// extern crates
use curve25519_dalek::edwards::EdwardsPoint;
use data_encoding::{BASE64, HEXUPPER};
use data_encoding_macro::new_encoding;
use rand::distributions::Alphanumeric;
use rand::Rng;
use rand_core::{OsRng, RngCore};
use sha1::{Digest, Sha1};
use sha2::Sha512;
use sha3::Sha3_256;
use static_assertions::const_assert_eq;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    ParseError(String),
}

/// The number of bytes in an expanded ed25519 secret key
pub const ED25519_PRIVATE_KEY_SIZE: usize = 64;
/// The number of bytes in an ed25519 public key
pub const ED25519_PUBLIC_KEY_SIZE: usize = 32;
/// The number of characters in a v3 onion service id
pub const V3_ONION_SERVICE_ID_LENGTH: usize = 56;
/// The number of characters in a base64 encoded ed25519 private key
pub const ED25519_PRIVATE_KEYBLOB_BASE64_LENGTH: usize = 88;
const ED25519_PRIVATE_KEYBLOB_HEADER: &str = "ED25519-V3:";
/// The number of characters in the keyblob header
pub const ED25519_PRIVATE_KEYBLOB_HEADER_LENGTH: usize = 11;
/// The number of characters in an ed25519 private keyblob
pub const ED25519_PRIVATE_KEYBLOB_LENGTH: usize =
    ED25519_PRIVATE_KEYBLOB_HEADER_LENGTH + ED25519_PRIVATE_KEYBLOB_BASE64_LENGTH;
// number of bytes in an onion service id after base32 decode
const V3_ONION_SERVICE_ID_RAW_SIZE: usize = 35;
// byte index of the start of the public key checksum
const V3_ONION_SERVICE_ID_CHECKSUM_OFFSET: usize = 32;
// byte index of the v3 onion service version
const V3_ONION_SERVICE_ID_VERSION_OFFSET: usize = 34;
const TRUNCATED_CHECKSUM_SIZE: usize = 2;
const ONION_ADDRESS_SUFFIX: &str = ".onion";

const_assert_eq!(
    ED25519_PRIVATE_KEYBLOB_HEADER.len(),
    ED25519_PRIVATE_KEYBLOB_HEADER_LENGTH
);
const_assert_eq!(ED25519_PRIVATE_KEYBLOB_LENGTH, 99);

const ONION_BASE32: data_encoding::Encoding = new_encoding! {
    symbols: "abcdefghijklmnopqrstuvwxyz234567",
    padding: '=',
};

const SHA1_BYTES: usize = 160 / 8;
const S2K_RFC2440_SPECIFIER_LEN: usize = 9;

// see https://github.com/torproject/torspec/blob/main/rend-spec-v3.txt#L2143
fn calc_truncated_checksum(
    public_key: &[u8; ED25519_PUBLIC_KEY_SIZE],
) -> [u8; TRUNCATED_CHECKSUM_SIZE] {
    let mut hasher = Sha3_256::new();
    hasher.update(b".onion checksum");
    hasher.update(public_key);
    hasher.update([0x03u8]);
    let hash_bytes = hasher.finalize();

    [hash_bytes[0], hash_bytes[1]]
}

// Free functions

/// Securely generate an alphanumeric password using OsRng
pub fn generate_password(length: usize) -> String {
    (0..length)
        .map(|_| char::from(OsRng.sample(Alphanumeric)))
        .collect()
}

fn hash_tor_password_with_salt(salt: &[u8; S2K_RFC2440_SPECIFIER_LEN], password: &str) -> String {
    assert!(salt[S2K_RFC2440_SPECIFIER_LEN - 1] == 0x60);

    // tor-specific rfc 2440 constants
    const EXPBIAS: u8 = 6u8;
    const C: u8 = 0x60; // salt[S2K_RFC2440_SPECIFIER_LEN - 1]
    const COUNT: usize = (16usize + ((C & 15u8) as usize)) << ((C >> 4) + EXPBIAS);

    // salt (sans the 'C' constant) followed by the password bytes
    let mut input: Vec<u8> = Vec::with_capacity(S2K_RFC2440_SPECIFIER_LEN + password.len());
    input.extend_from_slice(&salt[0..S2K_RFC2440_SPECIFIER_LEN - 1]);
    input.extend_from_slice(password.as_bytes());
    let input_len = input.len();

    let mut sha1 = Sha1::new();
    let mut count = COUNT;
    while count > 0 {
        if count > input_len {
            sha1.update(&input);
            count -= input_len;
        } else {
            sha1.update(&input[0..count]);
            break;
        }
    }
    let mut key = [0u8; SHA1_BYTES];
    key.copy_from_slice(&sha1.finalize());

    let mut hash = "16:".to_string();
    HEXUPPER.encode_append(salt, &mut hash);
    HEXUPPER.encode_append(&key, &mut hash);

    hash
}

/// Hash a control port password the way tor's `--hash-password` does
pub fn hash_tor_password(password: &str) -> String {
    let mut salt = [0x00u8; S2K_RFC2440_SPECIFIER_LEN];
    OsRng.fill_bytes(&mut salt);
    salt[S2K_RFC2440_SPECIFIER_LEN - 1] = 0x60u8;

    hash_tor_password_with_salt(&salt, password)
}

// Struct definitions

/// An expanded ed25519 secret key: the clamped scalar followed by the
/// nonce-generation prefix. This is the format tor's `ED25519-V3` key blobs
/// carry.
#[derive(Clone, PartialEq, Eq)]
pub struct Ed25519PrivateKey {
    expanded_secret_key: [u8; ED25519_PRIVATE_KEY_SIZE],
}

#[derive(Clone, PartialEq, Eq)]
pub struct Ed25519PublicKey {
    public_key: [u8; ED25519_PUBLIC_KEY_SIZE],
}

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct V3OnionServiceId {
    data: [u8; V3_ONION_SERVICE_ID_LENGTH],
}

// Ed25519 Private Key

impl Ed25519PrivateKey {
    pub fn generate() -> Ed25519PrivateKey {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);

        let mut expanded_secret_key = [0u8; ED25519_PRIVATE_KEY_SIZE];
        expanded_secret_key.copy_from_slice(&Sha512::digest(seed));
        expanded_secret_key[0] &= 248;
        expanded_secret_key[31] &= 127;
        expanded_secret_key[31] |= 64;

        Ed25519PrivateKey {
            expanded_secret_key,
        }
    }

    // any 64 byte string is accepted by tor here
    pub fn from_raw(raw: &[u8; ED25519_PRIVATE_KEY_SIZE]) -> Ed25519PrivateKey {
        Ed25519PrivateKey {
            expanded_secret_key: *raw,
        }
    }

    pub fn from_key_blob(key_blob: &str) -> Result<Ed25519PrivateKey, Error> {
        if key_blob.len() != ED25519_PRIVATE_KEYBLOB_LENGTH {
            return Err(Error::ParseError(format!(
                "expects string of length '{}'; received string with length '{}'",
                ED25519_PRIVATE_KEYBLOB_LENGTH,
                key_blob.len()
            )));
        }

        let base64_key = match key_blob.strip_prefix(ED25519_PRIVATE_KEYBLOB_HEADER) {
            Some(base64_key) => base64_key,
            None => {
                return Err(Error::ParseError(format!(
                    "expects string that begins with '{}'",
                    ED25519_PRIVATE_KEYBLOB_HEADER
                )))
            }
        };

        let private_key_data = match BASE64.decode(base64_key.as_bytes()) {
            Ok(private_key_data) => private_key_data,
            Err(_) => {
                return Err(Error::ParseError(format!(
                    "could not parse '{}' as base64",
                    base64_key
                )))
            }
        };
        let private_key_data_len = private_key_data.len();
        let private_key_data_raw: [u8; ED25519_PRIVATE_KEY_SIZE] = match private_key_data.try_into()
        {
            Ok(private_key_data) => private_key_data,
            Err(_) => {
                return Err(Error::ParseError(format!(
                    "expects decoded private key length '{}'; actual '{}'",
                    ED25519_PRIVATE_KEY_SIZE, private_key_data_len
                )))
            }
        };

        Ok(Ed25519PrivateKey::from_raw(&private_key_data_raw))
    }

    pub fn to_key_blob(&self) -> String {
        let mut key_blob = ED25519_PRIVATE_KEYBLOB_HEADER.to_string();
        BASE64.encode_append(&self.expanded_secret_key, &mut key_blob);

        key_blob
    }

    pub fn to_bytes(&self) -> [u8; ED25519_PRIVATE_KEY_SIZE] {
        self.expanded_secret_key
    }

    fn scalar_bytes(&self) -> [u8; 32] {
        let mut scalar = [0u8; 32];
        scalar.copy_from_slice(&self.expanded_secret_key[..32]);
        scalar
    }
}

impl std::fmt::Debug for Ed25519PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "--- ed25519 private key ---")
    }
}

// Ed25519 Public Key

impl Ed25519PublicKey {
    pub fn from_private_key(private_key: &Ed25519PrivateKey) -> Ed25519PublicKey {
        let point = EdwardsPoint::mul_base_clamped(private_key.scalar_bytes());
        Ed25519PublicKey {
            public_key: point.compress().to_bytes(),
        }
    }

    pub fn as_bytes(&self) -> &[u8; ED25519_PUBLIC_KEY_SIZE] {
        &self.public_key
    }
}

impl std::fmt::Debug for Ed25519PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", HEXUPPER.encode(&self.public_key))
    }
}

// Onion Service Id

impl V3OnionServiceId {
    pub fn from_string(service_id: &str) -> Result<V3OnionServiceId, Error> {
        if !V3OnionServiceId::is_valid(service_id) {
            return Err(Error::ParseError(format!(
                "'{}' is not a valid v3 onion service id",
                service_id
            )));
        }
        let mut data = [0u8; V3_ONION_SERVICE_ID_LENGTH];
        data.copy_from_slice(service_id.as_bytes());
        Ok(V3OnionServiceId { data })
    }

    /// Parse either a bare service id or a `<service id>.onion` address
    pub fn from_onion_address(address: &str) -> Result<V3OnionServiceId, Error> {
        let service_id = address
            .strip_suffix(ONION_ADDRESS_SUFFIX)
            .unwrap_or(address);
        Self::from_string(service_id)
    }

    pub fn from_public_key(public_key: &Ed25519PublicKey) -> V3OnionServiceId {
        let mut raw_service_id = [0u8; V3_ONION_SERVICE_ID_RAW_SIZE];

        raw_service_id[..ED25519_PUBLIC_KEY_SIZE].copy_from_slice(&public_key.as_bytes()[..]);
        let truncated_checksum = calc_truncated_checksum(public_key.as_bytes());
        raw_service_id[V3_ONION_SERVICE_ID_CHECKSUM_OFFSET] = truncated_checksum[0];
        raw_service_id[V3_ONION_SERVICE_ID_CHECKSUM_OFFSET + 1] = truncated_checksum[1];
        raw_service_id[V3_ONION_SERVICE_ID_VERSION_OFFSET] = 0x03u8;

        let mut service_id = [0u8; V3_ONION_SERVICE_ID_LENGTH];
        // panics on wrong buffer size, but given our constant buffer sizes should be fine
        ONION_BASE32.encode_mut(&raw_service_id, &mut service_id);

        V3OnionServiceId { data: service_id }
    }

    pub fn from_private_key(private_key: &Ed25519PrivateKey) -> V3OnionServiceId {
        Self::from_public_key(&Ed25519PublicKey::from_private_key(private_key))
    }

    pub fn is_valid(service_id: &str) -> bool {
        if service_id.len() != V3_ONION_SERVICE_ID_LENGTH {
            return false;
        }

        let mut decoded_service_id = [0u8; V3_ONION_SERVICE_ID_RAW_SIZE];
        match ONION_BASE32.decode_mut(service_id.as_bytes(), &mut decoded_service_id) {
            Ok(decoded_byte_count) => {
                if decoded_byte_count != V3_ONION_SERVICE_ID_RAW_SIZE {
                    return false;
                }
                if decoded_service_id[V3_ONION_SERVICE_ID_VERSION_OFFSET] != 0x03 {
                    return false;
                }
                let mut public_key = [0u8; ED25519_PUBLIC_KEY_SIZE];
                public_key[..].copy_from_slice(&decoded_service_id[..ED25519_PUBLIC_KEY_SIZE]);
                let truncated_checksum = calc_truncated_checksum(&public_key);
                truncated_checksum[..]
                    == decoded_service_id[V3_ONION_SERVICE_ID_CHECKSUM_OFFSET
                        ..V3_ONION_SERVICE_ID_CHECKSUM_OFFSET + TRUNCATED_CHECKSUM_SIZE]
            }
            Err(_) => false,
        }
    }

    pub fn as_str(&self) -> &str {
        // only ever constructed from base32 characters
        match str::from_utf8(&self.data) {
            Ok(service_id) => service_id,
            Err(_) => unreachable!(),
        }
    }

    pub fn to_onion_address(&self) -> String {
        format!("{}{}", self.as_str(), ONION_ADDRESS_SUFFIX)
    }
}

impl std::fmt::Display for V3OnionServiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Debug for V3OnionServiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
const TEST_PRIVATE_RAW: [u8; ED25519_PRIVATE_KEY_SIZE] = [
    0x60u8, 0x4du8, 0xc6u8, 0x66u8, 0xd0u8, 0xe6u8, 0x73u8, 0xe8u8, 0xb3u8, 0x1au8, 0x28u8, 0xd6u8,
    0x2au8, 0x07u8, 0x95u8, 0x45u8, 0xa6u8, 0xdbu8, 0x5eu8, 0xa2u8, 0xb8u8, 0xe7u8, 0xa2u8, 0x4au8,
    0x28u8, 0x63u8, 0x8du8, 0x0cu8, 0x18u8, 0x55u8, 0xfau8, 0x43u8, 0xc1u8, 0x54u8, 0xa6u8, 0xb6u8,
    0x98u8, 0x75u8, 0x50u8, 0xaau8, 0x74u8, 0x53u8, 0x56u8, 0xe1u8, 0x57u8, 0x7bu8, 0x78u8, 0xa7u8,
    0x53u8, 0x76u8, 0x16u8, 0xeau8, 0xabu8, 0xdcu8, 0xeeu8, 0x09u8, 0x58u8, 0x13u8, 0x07u8, 0xbdu8,
    0xacu8, 0xadu8, 0x0bu8, 0x85u8,
];

#[test]
fn test_ed25519() -> Result<(), anyhow::Error> {
    let private_key_blob = "ED25519-V3:YE3GZtDmc+izGijWKgeVRabbXqK456JKKGONDBhV+kPBVKa2mHVQqnRTVuFXe3inU3YW6qvc7glYEwe9rK0LhQ==";
    let public_raw: [u8; ED25519_PUBLIC_KEY_SIZE] = [
        0xf2u8, 0xfdu8, 0xa2u8, 0xdbu8, 0xf3u8, 0x80u8, 0xa6u8, 0xbau8, 0x74u8, 0xa4u8, 0x90u8,
        0xe1u8, 0x45u8, 0x55u8, 0xeeu8, 0xb9u8, 0x32u8, 0xa0u8, 0x5cu8, 0x39u8, 0x5au8, 0xe2u8,
        0x02u8, 0x83u8, 0x55u8, 0x27u8, 0x89u8, 0x6au8, 0x1fu8, 0x2fu8, 0x3du8, 0xc5u8,
    ];
    let service_id_string = "6l62fw7tqctlu5fesdqukvpoxezkaxbzllrafa2ve6ewuhzphxczsjyd";
    assert!(V3OnionServiceId::is_valid(service_id_string));

    let service_id = V3OnionServiceId::from_string(service_id_string)?;

    let private_key = Ed25519PrivateKey::from_raw(&TEST_PRIVATE_RAW);
    assert_eq!(private_key, Ed25519PrivateKey::from_key_blob(private_key_blob)?);
    assert_eq!(private_key_blob, private_key.to_key_blob());

    let public_key = Ed25519PublicKey::from_private_key(&private_key);
    assert_eq!(public_key.as_bytes(), &public_raw);
    assert_eq!(service_id, V3OnionServiceId::from_public_key(&public_key));
    assert_eq!(service_id, V3OnionServiceId::from_private_key(&private_key));

    // some invalid service ids
    assert!(!V3OnionServiceId::is_valid(""));
    assert!(!V3OnionServiceId::is_valid(
        "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"
    ));
    assert!(!V3OnionServiceId::is_valid(
        "6L62FW7TQCTLU5FESDQUKVPOXEZKAXBZLLRAFA2VE6EWUHZPHXCZSJYD"
    ));

    // malformed key blobs
    assert!(Ed25519PrivateKey::from_key_blob("").is_err());
    assert!(Ed25519PrivateKey::from_key_blob(&private_key_blob.replace("ED25519-V3:", "ED25519-V2:")).is_err());

    // generated keys always produce valid, distinct service ids
    let first = V3OnionServiceId::from_private_key(&Ed25519PrivateKey::generate());
    let second = V3OnionServiceId::from_private_key(&Ed25519PrivateKey::generate());
    assert!(V3OnionServiceId::is_valid(first.as_str()));
    assert_ne!(first, second);

    Ok(())
}

#[test]
fn test_onion_address() -> Result<(), anyhow::Error> {
    let private_key = Ed25519PrivateKey::from_raw(&TEST_PRIVATE_RAW);
    let service_id = V3OnionServiceId::from_private_key(&private_key);

    let address = service_id.to_onion_address();
    assert_eq!(
        address,
        "6l62fw7tqctlu5fesdqukvpoxezkaxbzllrafa2ve6ewuhzphxczsjyd.onion"
    );
    assert_eq!(V3OnionServiceId::from_onion_address(&address)?, service_id);
    assert_eq!(
        V3OnionServiceId::from_onion_address(service_id.as_str())?,
        service_id
    );
    assert!(V3OnionServiceId::from_onion_address("example.onion").is_err());
    assert!(V3OnionServiceId::from_onion_address(".onion").is_err());

    Ok(())
}

#[test]
fn test_password_hash() -> Result<(), anyhow::Error> {
    let salt1: [u8; S2K_RFC2440_SPECIFIER_LEN] = [
        0xbeu8, 0x2au8, 0x25u8, 0x1du8, 0xe6u8, 0x2cu8, 0xb2u8, 0x7au8, 0x60u8,
    ];
    let hash1 = hash_tor_password_with_salt(&salt1, "abcdefghijklmnopqrstuvwxyz");
    assert_eq!(
        hash1,
        "16:BE2A251DE62CB27A60AC9178A937990E8ED0AB662FA82A5C7DE3EBB23A"
    );

    let salt2: [u8; S2K_RFC2440_SPECIFIER_LEN] = [
        0x36u8, 0x73u8, 0x0eu8, 0xefu8, 0xd1u8, 0x8cu8, 0x60u8, 0xd6u8, 0x60u8,
    ];
    let hash2 = hash_tor_password_with_salt(&salt2, "password");
    assert_eq!(
        hash2,
        "16:36730EEFD18C60D66052E7EA535438761C0928D316EEA56A190C99B50A"
    );

    // ensure same password is hashed to different things
    assert_ne!(hash_tor_password("password"), hash_tor_password("password"));

    let password = generate_password(32);
    assert_eq!(password.len(), 32);
    assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));

    Ok(())
}
