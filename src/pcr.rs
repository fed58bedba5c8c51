use openssl::sha::Sha1;
use std::convert::TryFrom;

use crate::{Digest, Error, NUM_PCRS, PCR_SIZE};

/// PCRs reset to all-ones rather than zero (locality 4 / DRTM registers).
pub const LOCALITY_RESET_PCRS: [u32; 6] = [17, 18, 19, 20, 21, 22];

/// Reset value of a single PCR.
pub fn reset_value(index: u32) -> Digest {
    if LOCALITY_RESET_PCRS.contains(&index) {
        [0xFF; PCR_SIZE]
    } else {
        [0x00; PCR_SIZE]
    }
}

/// A simulated SHA-1 bank.
///
/// `extend` is the only way to change a value, so every register is always the
/// reset value folded with the exact sequence of extends applied to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcrBank {
    values: [Digest; NUM_PCRS],
}

impl Default for PcrBank {
    fn default() -> Self {
        Self::new()
    }
}

impl PcrBank {
    pub fn new() -> Self {
        let mut values = [[0; PCR_SIZE]; NUM_PCRS];
        for (index, value) in values.iter_mut().enumerate() {
            *value = reset_value(index as u32);
        }
        PcrBank { values }
    }

    fn slot(index: u32) -> Result<usize, Error> {
        usize::try_from(index)
            .ok()
            .filter(|&i| i < NUM_PCRS)
            .ok_or(Error::PcrIndexOutOfRange(index))
    }

    /// `pcr[index] = SHA1(pcr[index] || digest)`
    pub fn extend(&mut self, index: u32, digest: &Digest) -> Result<(), Error> {
        let slot = Self::slot(index)?;
        let mut hasher = Sha1::new();
        hasher.update(&self.values[slot]);
        hasher.update(digest);
        self.values[slot] = hasher.finish();
        Ok(())
    }

    pub fn get(&self, index: u32) -> Result<&Digest, Error> {
        Ok(&self.values[Self::slot(index)?])
    }

    /// Overwrites a register with a value read elsewhere (the live TPM).
    pub(crate) fn assume(&mut self, index: u32, value: Digest) -> Result<(), Error> {
        self.values[Self::slot(index)?] = value;
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &Digest)> {
        self.values
            .iter()
            .enumerate()
            .map(|(index, value)| (index as u32, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash_bytes;

    #[test]
    fn reset_values() {
        let bank = PcrBank::new();
        for (index, value) in bank.iter() {
            if (17..=22).contains(&index) {
                assert_eq!(value, &[0xFF; 20], "PCR {}", index);
            } else {
                assert_eq!(value, &[0x00; 20], "PCR {}", index);
            }
        }
        assert_eq!(bank.iter().count(), 24);
    }

    #[test]
    fn extend_chains() {
        let mut bank = PcrBank::new();
        bank.extend(0, &[0x11; 20]).unwrap();
        bank.extend(0, &[0x22; 20]).unwrap();

        let first = hash_bytes(&[[0x00; 20], [0x11; 20]].concat());
        let second = hash_bytes(&[first, [0x22; 20]].concat());
        assert_eq!(bank.get(0).unwrap(), &second);
        assert_eq!(bank.get(1).unwrap(), &[0; 20]);
    }

    #[test]
    fn extend_locality_register() {
        let mut bank = PcrBank::new();
        bank.extend(17, &[0; 20]).unwrap();
        assert_eq!(
            bank.get(17).unwrap(),
            &hash_bytes(&[[0xFF; 20], [0x00; 20]].concat())
        );
    }

    #[test]
    fn known_vector() {
        // sha1(20 zero bytes || sha1(""))
        let mut bank = PcrBank::new();
        bank.extend(5, &hash_bytes(b"")).unwrap();
        assert_eq!(
            crate::to_hex(bank.get(5).unwrap()),
            "31a2dc4c22f9c5444a41625d05f95898e055f750"
        );
    }

    #[test]
    fn out_of_range() {
        let mut bank = PcrBank::new();
        assert!(matches!(
            bank.extend(24, &[0; 20]),
            Err(Error::PcrIndexOutOfRange(24))
        ));
        assert!(matches!(
            bank.extend(crate::VIRTUAL_PCR, &[0; 20]),
            Err(Error::PcrIndexOutOfRange(_))
        ));
        assert_eq!(bank, PcrBank::new());
    }
}
