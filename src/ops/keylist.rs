//! Key listings, parsed from the engine's colon-delimited output.
//!
//! Each `pub`/`sec`/`crt`/`crs` record starts a new key and finishes the
//! previous one. Finished keys are queued for [`Context::keylist_next`] and
//! announced with a next-key event.
//!
//! [`Context::keylist_next`]: crate::Context::keylist_next

use std::collections::VecDeque;

use bitflags::bitflags;
use log::trace;

use super::{push_checked, Validity};
use crate::dispatch::{ColonHandler, Notice, Session, StatusHandler};
use crate::engine::info::Protocol;
use crate::error::Error;
use crate::status::{decode_c_string, parse_hex_byte, parse_number, parse_timestamp, StatusCode};

/// Colon records carry at most this many fields.
const MAX_FIELDS: usize = 20;

bitflags! {
    /// Which keys and details a listing includes.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct KeylistMode: u32 {
        const LOCAL = 1;
        /// Ask the engine to locate keys externally.
        const EXTERN = 2;
        /// Include key signatures on user IDs.
        const SIGS = 4;
    }
}

impl Default for KeylistMode {
    fn default() -> Self {
        KeylistMode::LOCAL
    }
}

/// Capability and trust flags shared by keys and subkeys.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyFlags {
    pub revoked: bool,
    pub expired: bool,
    pub disabled: bool,
    pub invalid: bool,
    pub can_encrypt: bool,
    pub can_sign: bool,
    pub can_certify: bool,
    pub can_authenticate: bool,
}

impl KeyFlags {
    fn apply_trust(&mut self, field: &str) {
        for c in field.chars().take_while(|c| !c.is_ascii_digit()) {
            match c {
                'e' => self.expired = true,
                'r' => self.revoked = true,
                'd' => self.disabled = true,
                'i' => self.invalid = true,
                _ => (),
            }
        }
    }

    /// Lower-case letters describe a subkey; the primary key's summary
    /// flags take both cases.
    fn apply_capabilities(&mut self, field: &str, summary: bool) {
        for c in field.chars() {
            if c.is_ascii_uppercase() && !summary {
                continue;
            }
            match c.to_ascii_lowercase() {
                'e' => self.can_encrypt = true,
                's' => self.can_sign = true,
                'c' => self.can_certify = true,
                'a' => self.can_authenticate = true,
                'd' => self.disabled = true,
                _ => (),
            }
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Subkey {
    pub flags: KeyFlags,
    pub secret: bool,
    pub length: u32,
    pub pubkey_algo: u32,
    pub keyid: String,
    pub fpr: Option<String>,
    pub timestamp: i64,
    /// 0 if the subkey does not expire.
    pub expires: i64,
}

/// A certification on a user ID.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeySig {
    /// Set for `rev` records and revocation classes.
    pub revoked: bool,
    pub keyid: String,
    pub pubkey_algo: u32,
    pub timestamp: i64,
    pub expires: i64,
    pub sig_class: u8,
    pub exportable: bool,
    pub uid: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserId {
    pub revoked: bool,
    pub invalid: bool,
    pub validity: Validity,
    pub uid: String,
    pub signatures: Vec<KeySig>,
}

/// A key from a listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Key {
    pub protocol: Protocol,
    pub secret: bool,
    /// Summary over the primary key and its subkeys.
    pub flags: KeyFlags,
    pub owner_trust: Validity,
    pub fpr: Option<String>,
    /// The primary key comes first.
    pub subkeys: Vec<Subkey>,
    pub uids: Vec<UserId>,
}

/// Summary of a finished listing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeylistResult {
    /// The engine stopped listing early.
    pub truncated: bool,
}

#[derive(Debug, Default)]
pub(crate) struct KeylistData {
    pub(crate) result: KeylistResult,
    pub(crate) queue: VecDeque<Key>,
    current: Option<Key>,
    in_uid: bool,
}

impl KeylistData {
    fn finish_key(&mut self, notices: &mut Vec<Notice>) -> Result<(), Error> {
        if let Some(key) = self.current.take() {
            trace!("Listed key {:?}", key.fpr);
            self.queue.try_reserve(1).map_err(|_| Error::OutOfCore)?;
            self.queue.push_back(key);
            notices.push(Notice::NextKey);
        }
        Ok(())
    }
}

fn number(field: &str) -> Result<u32, Error> {
    if field.is_empty() {
        Ok(0)
    } else {
        parse_number(field)
    }
}

fn timestamp(field: &str) -> Result<i64, Error> {
    if field.is_empty() {
        Ok(0)
    } else {
        parse_timestamp(field)
    }
}

/// Fills the common key record fields 2 to 7 into `subkey`.
fn parse_subkey(fields: &[&str], secret: bool) -> Result<Subkey, Error> {
    let field = |i: usize| fields.get(i).copied().unwrap_or("");
    let mut subkey = Subkey {
        secret,
        length: number(field(2))?,
        pubkey_algo: number(field(3))?,
        keyid: field(4).to_owned(),
        timestamp: timestamp(field(5))?,
        expires: timestamp(field(6))?,
        ..Subkey::default()
    };
    subkey.flags.apply_trust(field(1));
    subkey.flags.apply_capabilities(field(11), false);
    Ok(subkey)
}

fn parse_key_sig(fields: &[&str], revoked: bool) -> Result<KeySig, Error> {
    let field = |i: usize| fields.get(i).copied().unwrap_or("");
    let mut sig = KeySig {
        revoked,
        pubkey_algo: number(field(3))?,
        keyid: field(4).to_owned(),
        timestamp: timestamp(field(5))?,
        expires: timestamp(field(6))?,
        uid: Some(field(9))
            .filter(|uid| !uid.is_empty())
            .map(decode_c_string)
            .transpose()?,
        ..KeySig::default()
    };
    let class = field(10);
    if let Some(hex) = class.get(..2) {
        sig.sig_class = parse_hex_byte(hex)?;
        sig.revoked |= sig.sig_class == 0x30;
        sig.exportable = class[2..].starts_with('x');
    }
    Ok(sig)
}

pub(crate) struct KeylistColon;

impl ColonHandler for KeylistColon {
    fn handle(&self, session: &mut Session<'_>, line: Option<&str>) -> Result<(), Error> {
        let data = session.results.get_or_create::<KeylistData>()?;
        let line = match line {
            Some(line) => line,
            None => return data.finish_key(session.notices),
        };

        let fields: Vec<&str> = line.splitn(MAX_FIELDS, ':').collect();
        let field = |i: usize| fields.get(i).copied().unwrap_or("");
        let record = field(0);

        // Signatures only belong to the user ID directly above them.
        if record != "sig" && record != "rev" {
            data.in_uid = false;
        }

        match record {
            "pub" | "sec" | "crt" | "crs" => {
                data.finish_key(session.notices)?;
                let secret = record == "sec" || record == "crs";
                let protocol = if record == "crt" || record == "crs" {
                    Protocol::Cms
                } else {
                    session.protocol
                };
                let primary = parse_subkey(&fields, secret)?;
                let mut flags = KeyFlags::default();
                flags.apply_trust(field(1));
                flags.apply_capabilities(field(11), true);
                data.current = Some(Key {
                    protocol,
                    secret,
                    flags,
                    owner_trust: field(8)
                        .chars()
                        .next()
                        .map_or(Validity::Unknown, Validity::from_letter),
                    fpr: None,
                    subkeys: vec![primary],
                    uids: vec![],
                });
            }
            "sub" | "ssb" => {
                if let Some(key) = data.current.as_mut() {
                    let subkey = parse_subkey(&fields, record == "ssb")?;
                    push_checked(&mut key.subkeys, subkey)?;
                }
            }
            "uid" => {
                if let Some(key) = data.current.as_mut() {
                    let mut uid = UserId {
                        uid: decode_c_string(field(9))?,
                        ..UserId::default()
                    };
                    for c in field(1).chars().take_while(|c| !c.is_ascii_digit()) {
                        match c {
                            'r' => uid.revoked = true,
                            'i' => uid.invalid = true,
                            'n' | 'm' | 'f' | 'u' => uid.validity = Validity::from_letter(c),
                            _ => (),
                        }
                    }
                    push_checked(&mut key.uids, uid)?;
                    data.in_uid = true;
                }
            }
            "fpr" => {
                if let Some(key) = data.current.as_mut() {
                    let fpr = field(9);
                    let first = key.subkeys.len() == 1;
                    if let Some(subkey) = key.subkeys.last_mut() {
                        if !fpr.is_empty() && subkey.fpr.is_none() {
                            subkey.fpr = Some(fpr.to_owned());
                            if first && key.fpr.is_none() {
                                key.fpr = Some(fpr.to_owned());
                            }
                        }
                    }
                }
            }
            "sig" | "rev" if data.in_uid => {
                let sig = parse_key_sig(&fields, record == "rev")?;
                if let Some(uid) = data.current.as_mut().and_then(|key| key.uids.last_mut()) {
                    push_checked(&mut uid.signatures, sig)?;
                }
            }
            _ => (),
        }
        Ok(())
    }
}

pub(crate) struct KeylistStatus;

impl StatusHandler for KeylistStatus {
    fn handle(&self, session: &mut Session<'_>, code: StatusCode, _: &str) -> Result<(), Error> {
        if code == StatusCode::Truncated {
            session
                .results
                .get_or_create::<KeylistData>()?
                .result
                .truncated = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{KeylistColon, KeylistData, KeylistStatus};
    use crate::dispatch::testing::Harness;
    use crate::dispatch::{ColonHandler, Notice};
    use crate::engine::info::Protocol;
    use crate::error::Error;
    use crate::ops::Validity;

    const LISTING: &[&str] = &[
        "tru::1:1700000000:0:3:1:5",
        "pub:u:255:22:1111222233334444:1700000000:1800000000::u:::scESC::::ed25519:::0:",
        "fpr:::::::::AAAABBBBCCCCDDDDEEEEFFFF1111222233334444:",
        "uid:u::::1700000000::HASH::Alice \\x3cb\\x3e <alice@example.org>::::::::::0:",
        "sig:!::22:1111222233334444:1700000000::::Alice:13x::",
        "sub:e:255:18:5555666677778888:1700000000::::::e::::cv25519:::0:",
        "fpr:::::::::99998888777766665555444433332222:",
        "sig:!::22:1111222233334444:1700000000::::Alice:18x::",
        "pub:r:2048:1:9999AAAABBBBCCCC:1500000000:::-:::sc::::::::0:",
    ];

    fn list(lines: &[&str]) -> (Harness, Result<(), Error>) {
        let mut harness = Harness::default();
        let mut outcome = Ok(());
        for line in lines.iter().map(|l| Some(*l)).chain(Some(None)) {
            outcome = KeylistColon.handle(&mut harness.session(), line);
            if outcome.is_err() {
                break;
            }
        }
        (harness, outcome)
    }

    #[test]
    fn listing_is_parsed() {
        let (harness, outcome) = list(LISTING);
        outcome.unwrap();
        assert_eq!(harness.notices, vec![Notice::NextKey, Notice::NextKey]);

        let data = harness.results.lookup::<KeylistData>().unwrap();
        assert_eq!(data.queue.len(), 2);
        let key = &data.queue[0];
        assert_eq!(key.protocol, Protocol::OpenPgp);
        assert_eq!(
            key.fpr.as_deref(),
            Some("AAAABBBBCCCCDDDDEEEEFFFF1111222233334444")
        );
        assert_eq!(key.owner_trust, Validity::Ultimate);
        assert!(key.flags.can_encrypt && key.flags.can_sign && key.flags.can_certify);

        let primary = &key.subkeys[0];
        assert!(primary.flags.can_sign && primary.flags.can_certify);
        assert!(!primary.flags.can_encrypt);
        assert_eq!(primary.length, 255);
        assert_eq!(primary.pubkey_algo, 22);
        assert_eq!(primary.expires, 1_800_000_000);

        let sub = &key.subkeys[1];
        assert!(sub.flags.expired && sub.flags.can_encrypt);
        assert_eq!(
            sub.fpr.as_deref(),
            Some("99998888777766665555444433332222")
        );

        assert_eq!(key.uids.len(), 1);
        let uid = &key.uids[0];
        assert_eq!(uid.uid, "Alice <b> <alice@example.org>");
        assert_eq!(uid.validity, Validity::Ultimate);
        // The second sig follows a subkey and is not attached.
        assert_eq!(uid.signatures.len(), 1);
        assert_eq!(uid.signatures[0].sig_class, 0x13);
        assert!(uid.signatures[0].exportable);

        let revoked = &data.queue[1];
        assert!(revoked.flags.revoked && revoked.subkeys[0].flags.revoked);
        assert_eq!(revoked.owner_trust, Validity::Undefined);
    }

    #[test]
    fn records_without_key_are_ignored() {
        let (harness, outcome) = list(&["uid:u::::::::Nobody:", "fpr:::::::::ABCD:"]);
        outcome.unwrap();
        assert!(harness.notices.is_empty());
    }

    #[test]
    fn malformed_numbers_are_engine_errors() {
        let (_, outcome) = list(&["pub:u:big:22:1111222233334444:1700000000:::u:::sc:"]);
        assert!(matches!(outcome, Err(Error::InvalidEngine)));
    }

    #[test]
    fn truncated_status() {
        let mut harness = Harness::default();
        harness
            .feed(&KeylistStatus, &["TRUNCATED 100", "EOF"])
            .unwrap();
        assert!(
            harness
                .results
                .lookup::<KeylistData>()
                .unwrap()
                .result
                .truncated
        );
    }
}
