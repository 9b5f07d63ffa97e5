//! Per-context result accumulators, one per operation kind.

use crate::error::Error;
use crate::ops::decrypt::DecryptResult;
use crate::ops::encrypt::EncryptResult;
use crate::ops::genkey::GenkeyResult;
use crate::ops::import::ImportResult;
use crate::ops::keylist::KeylistData;
use crate::ops::passphrase::PassphraseData;
use crate::ops::sign::SignResult;
use crate::ops::verify::VerifyResult;

/// Identifies which operation a record accumulates results for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OpKind {
    Verify,
    Decrypt,
    Sign,
    Encrypt,
    Passphrase,
    Import,
    Genkey,
    Keylist,
}

/// A typed record that can live in an [`OpDataRegistry`].
pub(crate) trait Record: Default + Sized {
    const KIND: OpKind;

    fn wrap(self) -> OpData;
    fn unwrap_ref(data: &OpData) -> Option<&Self>;
    fn unwrap_mut(data: &mut OpData) -> Option<&mut Self>;
}

macro_rules! records {
    ($($kind:ident => $ty:ty,)*) => {
        pub(crate) enum OpData {
            $($kind($ty),)*
        }

        impl OpData {
            fn kind(&self) -> OpKind {
                match self {
                    $(OpData::$kind(_) => OpKind::$kind,)*
                }
            }
        }

        $(
            impl Record for $ty {
                const KIND: OpKind = OpKind::$kind;

                fn wrap(self) -> OpData {
                    OpData::$kind(self)
                }

                fn unwrap_ref(data: &OpData) -> Option<&Self> {
                    match data {
                        OpData::$kind(record) => Some(record),
                        _ => None,
                    }
                }

                fn unwrap_mut(data: &mut OpData) -> Option<&mut Self> {
                    match data {
                        OpData::$kind(record) => Some(record),
                        _ => None,
                    }
                }
            }
        )*
    };
}

records! {
    Verify => VerifyResult,
    Decrypt => DecryptResult,
    Sign => SignResult,
    Encrypt => EncryptResult,
    Passphrase => PassphraseData,
    Import => ImportResult,
    Genkey => GenkeyResult,
    Keylist => KeylistData,
}

/// Holds at most one record per [`OpKind`]. Records are created on first
/// use and dropped together when the owning context is reset.
#[derive(Default)]
pub(crate) struct OpDataRegistry {
    records: Vec<OpData>,
}

impl OpDataRegistry {
    /// Returns the record for `R` without creating it.
    pub(crate) fn lookup<R: Record>(&self) -> Option<&R> {
        self.records
            .iter()
            .find(|data| data.kind() == R::KIND)
            .and_then(R::unwrap_ref)
    }

    pub(crate) fn lookup_mut<R: Record>(&mut self) -> Option<&mut R> {
        self.records
            .iter_mut()
            .find(|data| data.kind() == R::KIND)
            .and_then(R::unwrap_mut)
    }

    /// Returns the record for `R`, creating an empty one on first use.
    pub(crate) fn get_or_create<R: Record>(&mut self) -> Result<&mut R, Error> {
        let index = match self.records.iter().position(|data| data.kind() == R::KIND) {
            Some(index) => index,
            None => {
                self.records
                    .try_reserve(1)
                    .map_err(|_| Error::OutOfCore)?;
                self.records.push(R::default().wrap());
                self.records.len() - 1
            }
        };
        R::unwrap_mut(&mut self.records[index]).ok_or(Error::General)
    }

    pub(crate) fn clear(&mut self) {
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::OpDataRegistry;
    use crate::ops::passphrase::PassphraseData;
    use crate::ops::sign::SignResult;

    #[test]
    fn lookup_does_not_create() {
        let registry = OpDataRegistry::default();
        assert!(registry.lookup::<SignResult>().is_none());
        assert!(registry.records.is_empty());
    }

    #[test]
    fn repeated_lookup_returns_same_record() {
        let mut registry = OpDataRegistry::default();
        registry
            .get_or_create::<PassphraseData>()
            .unwrap()
            .bad_passphrase = 3;
        registry.get_or_create::<SignResult>().unwrap();

        let again = registry.get_or_create::<PassphraseData>().unwrap();
        assert_eq!(again.bad_passphrase, 3);
        assert_eq!(registry.records.len(), 2);
        assert_eq!(
            registry.lookup::<PassphraseData>().map(|p| p.bad_passphrase),
            Some(3)
        );
    }

    #[test]
    fn clear_drops_every_record() {
        let mut registry = OpDataRegistry::default();
        registry.get_or_create::<SignResult>().unwrap();
        registry.clear();
        assert!(registry.lookup::<SignResult>().is_none());
    }
}
