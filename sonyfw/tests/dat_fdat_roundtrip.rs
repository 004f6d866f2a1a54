//! Cross-module end-to-end scenario: assemble a `.dat` container whose
//! `FDAT` chunk is gen-2 AES-encrypted, round-trip it through
//! `write_dat`/`read_dat`, trial-decrypt the result, and parse the
//! recovered `FDAT` payload. Exercises `dat`, `cipher`, and `fdat`
//! together the way a real firmware image does.

use sonyfw::cipher::{self, CrypterId, KeyProvider};
use sonyfw::dat::{self, DatRecord, UsbDescriptor};
use sonyfw::fdat::{self, FdatFields};
use sonyfw::Result;
use std::io::{Cursor, Read};

struct FixedKeys;

impl KeyProvider for FixedKeys {
    fn sha_key(&self, _id: CrypterId) -> Result<[u8; 40]> {
        Ok([0x11u8; 40])
    }
    fn aes_key(&self, id: CrypterId) -> Result<[u8; 16]> {
        if id == CrypterId::CXD4132 {
            Ok([0x5au8; 16])
        } else {
            Ok([0xa5u8; 16])
        }
    }
    fn double_aes_keys(&self, _id: CrypterId) -> Result<([u8; 16], [u8; 16])> {
        Ok(([0x22u8; 16], [0x33u8; 16]))
    }
    fn aes_cbc_keys(&self, _id: CrypterId) -> Result<([u8; 16], [u8; 16])> {
        Ok(([0x44u8; 16], [0x55u8; 16]))
    }
    fn ms_firm_key(&self, _id: CrypterId) -> Result<[u8; 64]> {
        Ok([0x66u8; 64])
    }
}

#[test]
fn dat_decrypt_trial_recovers_a_gen2_fdat_payload() {
    let keys = FixedKeys;

    let fields = FdatFields {
        model: 0x00A0_1234,
        region: 1,
        version_major: 4,
        version_minor: 1,
    };
    let mut fdat_plain = Vec::new();
    fdat::write_fdat(
        &fields,
        &mut Cursor::new(Vec::new()),
        &mut Cursor::new(vec![0x42u8]),
        &mut fdat_plain,
    )
    .unwrap();

    let mut encrypted = Vec::new();
    cipher::encrypt_fdat(Cursor::new(fdat_plain), CrypterId::CXD4132, &keys)
        .unwrap()
        .read_to_end(&mut encrypted)
        .unwrap();

    let record = DatRecord {
        is_lens: false,
        normal_usb_descriptors: vec![UsbDescriptor {
            pid: 0x1234,
            vid: 0x054c,
        }],
        updater_usb_descriptors: vec![],
        firmware_data: encrypted,
    };
    let mut dat_bytes = Vec::new();
    dat::write_dat(&record, &mut dat_bytes).unwrap();

    assert!(dat::is_dat(&mut Cursor::new(&dat_bytes)));
    let parsed_dat = dat::read_dat(&mut Cursor::new(&dat_bytes)).unwrap();
    assert_eq!(parsed_dat, record);

    let (crypter_id, decrypted) =
        cipher::decrypt_fdat(Cursor::new(parsed_dat.firmware_data.clone()), &keys, fdat::is_fdat).unwrap();
    assert_eq!(crypter_id, CrypterId::CXD4132);

    let parsed_fdat = fdat::read_fdat(decrypted).unwrap();
    assert_eq!(parsed_fdat.model, 0x00A0_1234);
    assert!(parsed_fdat.is_accessory);
    assert_eq!(parsed_fdat.version, "4.01");

    let mut firmware_source = parsed_fdat.firmware;
    let mut firmware = Vec::new();
    firmware_source.read_to_end(&mut firmware).unwrap();
    assert_eq!(firmware, vec![0x42u8]);
}
