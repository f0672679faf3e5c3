extern crate cryptsetup_core;
extern crate env_logger;
extern crate hex;
extern crate luks_header;

use std::env;
use std::io::{self, Write};

use cryptsetup_core::crypto::SectorCipher;
use cryptsetup_core::device::read_header;
use cryptsetup_core::Result;
use luks_header::{Luks1Header, Luks2Header, LuksHeader, LuksHeaderV1, LuksHeaderV2, LuksVersionedHeader};

/// Prints the header fields as stored; the cipher does not have to be one this crate can unlock
fn dump_luks1<W: Write>(out: &mut W, device_path: &str, header: &LuksHeaderV1) -> Result<()> {
    let cipher_name = header.cipher_name()?;
    let cipher_mode = header.cipher_mode()?;

    writeln!(out, "LUKS header information for {}", device_path)?;
    writeln!(out)?;
    writeln!(out, "{:<16}{}", "Version:", header.version())?;
    writeln!(out, "{:<16}{}", "Cipher name:", cipher_name)?;
    writeln!(out, "{:<16}{}", "Cipher mode:", cipher_mode)?;
    writeln!(out, "{:<16}{}", "Hash spec:", header.hash_spec()?)?;
    writeln!(out, "{:<16}{}", "Payload offset:", header.payload_offset())?;
    writeln!(out, "{:<16}{}", "MK bits:", header.key_bytes() * 8)?;
    writeln!(out, "{:<16}{}", "MK digest:", hex::encode(header.mk_digest()))?;

    let salt = header.mk_digest_salt();
    writeln!(out, "{:<16}{}", "MK salt:", hex::encode(&salt[..16]))?;
    writeln!(out, "{:<16}{}", "", hex::encode(&salt[16..]))?;
    writeln!(out, "{:<16}{}", "MK iterations:", header.mk_digest_iterations())?;
    writeln!(out, "{:<16}{}", "UUID:", header.uuid()?)?;
    if let Err(e) = SectorCipher::check(cipher_name, cipher_mode, header.key_bytes() as usize) {
        writeln!(out, "{:<16}{}", "Note:", e)?;
    }
    writeln!(out)?;

    for (slot, keyslot) in header.keyslots().iter().enumerate() {
        if keyslot.is_active() {
            writeln!(out, "Key Slot {}: ENABLED", slot)?;
            writeln!(out, "\t{:<24}{}", "Iterations:", keyslot.iterations())?;
            writeln!(out, "\t{:<24}{}", "Salt:", hex::encode(&keyslot.salt()[..16]))?;
            writeln!(out, "\t{:<24}{}", "", hex::encode(&keyslot.salt()[16..]))?;
            writeln!(out, "\t{:<24}{}", "Key material offset:", keyslot.key_material_offset())?;
            writeln!(out, "\t{:<24}{}", "AF stripes:", keyslot.stripes())?;
        } else {
            writeln!(out, "Key Slot {}: DISABLED", slot)?;
        }
    }
    Ok(())
}

fn dump_luks2<W: Write>(out: &mut W, device_path: &str, header: &LuksHeaderV2) -> Result<()> {
    writeln!(out, "LUKS header information for {}", device_path)?;
    writeln!(out)?;
    writeln!(out, "{:<16}{}", "Version:", header.version())?;
    writeln!(out, "{:<16}{}", "Epoch:", header.seqid())?;
    writeln!(out, "{:<16}{}", "Metadata area:", header.header_size())?;
    writeln!(out, "{:<16}{}", "UUID:", header.uuid()?)?;
    writeln!(out, "{:<16}{}", "Label:", header.label()?.unwrap_or("(no label)"))?;
    writeln!(out, "{:<16}{}", "Subsystem:", header.subsystem()?.unwrap_or("(no subsystem)"))?;
    writeln!(out)?;
    writeln!(out, "Key slots are kept in the JSON metadata area and are not shown")?;
    Ok(())
}

fn dump<W: Write>(out: &mut W, device_path: &str) -> Result<()> {
    match read_header(device_path)? {
        LuksHeader::Luks1(v1) => dump_luks1(out, device_path, &v1),
        LuksHeader::Luks2(v2) => dump_luks2(out, device_path, &v2),
    }
}

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().skip(1).collect();
    if args.len() != 1 {
        println!("Usage: luks_dump <device path>");
        ::std::process::exit(1);
    }
    let device_path = args[0].as_str();

    let stdout = io::stdout();
    if let Err(e) = dump(&mut stdout.lock(), device_path) {
        println!("Error: {}", e);
        ::std::process::exit(2);
    }
}
