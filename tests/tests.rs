#![allow(unused)]

extern crate cryptsetup_core;
extern crate env_logger;
extern crate expectest;
extern crate log;
extern crate tempfile;
extern crate uuid;

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use expectest::prelude::*;
use tempfile::{Builder, TempDir};
use uuid::Uuid;

use cryptsetup_core::*;

const IMAGE_SIZE: u64 = 4 * 1024 * 1024;
const SCENARIO_UUID: &str = "12345678-1234-1234-1234-123456789abc";

type Records = Arc<Mutex<Vec<(Priority, String)>>>;

struct TestContext {
    dir: TempDir,
    name: String,
    records: Records,
}

impl TestContext {
    fn new(name: &str) -> TestContext {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = Builder::new().prefix(name).tempdir().expect("Tempdir!");
        TestContext {
            dir,
            name: name.to_string(),
            records: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn logger(&self) -> impl Logger {
        let records = Arc::clone(&self.records);
        move |priority: Priority, message: &str| records.lock().unwrap().push((priority, message.to_string()))
    }

    fn setup<B: ActivationBackend>(&self, backend: B) -> CryptSetup<B> {
        CryptSetup::new(self.logger(), FixedAnswer(true), backend)
    }

    fn messages(&self) -> Vec<String> {
        self.records.lock().unwrap().iter().map(|(_, m)| m.clone()).collect()
    }

    fn new_image(&self, suffix: &str) -> PathBuf {
        let path = self.dir.path().join(format!("{}-{}.image", self.name, suffix));
        let file = File::create(&path).expect("image file");
        file.set_len(IMAGE_SIZE).expect("image size");
        path
    }

    /// A LUKS1 image with `passphrase` in slot 0 and cheap key derivation
    fn new_luks_image<B: ActivationBackend>(&self, setup: &CryptSetup<B>, suffix: &str, passphrase: &str) -> PathBuf {
        let path = self.new_image(suffix);
        setup
            .luks_format(&path)
            .iterations(10)
            .uuid(Uuid::parse_str(SCENARIO_UUID).unwrap())
            .luks1(passphrase)
            .expect("LUKS format should succeed");
        path
    }
}

const XTS_FIXTURE: &[u8] = include_bytes!("fixtures/luks1-aes-xts-plain64-sha256.img");
const ESSIV_FIXTURE: &[u8] = include_bytes!("fixtures/luks1-aes-cbc-essiv-sha1.img");

/// Copy of a pre-built image, grown to `IMAGE_SIZE` so the payload is non-empty
fn fixture_image(ctx: &TestContext, suffix: &str, bytes: &[u8]) -> PathBuf {
    let path = ctx.new_image(suffix);
    let mut file = OpenOptions::new().write(true).open(&path).unwrap();
    file.write_all(bytes).unwrap();
    path
}

fn key_file(ctx: &TestContext, name: &str, content: &[u8]) -> PathBuf {
    let path = ctx.dir.path().join(name);
    fs::write(&path, content).unwrap();
    path
}

fn head(path: &Path, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    File::open(path).unwrap().read_exact(&mut buf).unwrap();
    buf
}

/// Fails every activation, or every deactivation once `fail_close` is set
#[derive(Default)]
struct FlakyBackend {
    inner: MemoryBackend,
    fail_open: bool,
    fail_close: AtomicBool,
}

impl ActivationBackend for FlakyBackend {
    fn activate(&self, request: &ActivationRequest<'_>) -> std::result::Result<(), BackendError> {
        if self.fail_open {
            return Err(BackendError::new(1, "create ioctl failed: Operation not permitted"));
        }
        self.inner.activate(request)
    }

    fn deactivate(&self, name: &str) -> std::result::Result<(), BackendError> {
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(BackendError::new(16, "remove ioctl failed: Device or resource busy"));
        }
        self.inner.deactivate(name)
    }

    fn query_state(&self, name: &str) -> BackendState {
        self.inner.query_state(name)
    }
}

#[test]
fn test_uuid_open_status_close_scenario() {
    let ctx = TestContext::new("scenario");
    let setup = ctx.setup(MemoryBackend::new());
    let device = ctx.new_luks_image(&setup, "loop0", "sifra");

    expect!(setup.is_luks(&device)).to(be_true());
    expect!(setup.luks_uuid(&device)).to(be_ok().value(SCENARIO_UUID.to_string()));
    expect!(setup.luks_status("sifra")).to(be_equal_to(VolumeStatus::Inactive));

    expect!(setup.luks_open(&device, "sifra", "sifra")).to(be_ok().value(0));
    expect!(setup.luks_status("sifra")).to(be_equal_to(VolumeStatus::Active));

    let info = setup.luks_status_info("sifra").expect("status info");
    expect!(info.device).to(be_equal_to(device.clone()));
    expect!(info.cipher.as_str()).to(be_equal_to("aes-xts-plain64"));
    expect!(info.key_bits).to(be_equal_to(256));
    expect!(info.payload_offset).to(be_equal_to(4096));
    expect!(info.size).to(be_equal_to(IMAGE_SIZE / 512 - 4096));
    expect!(info.read_only).to(be_false());

    let mapping = setup.backend().mapping("sifra").expect("backend mapping");
    expect!(mapping.key_bits).to(be_equal_to(256));

    expect!(setup.luks_close("sifra")).to(be_ok());
    expect!(setup.luks_status("sifra")).to(be_equal_to(VolumeStatus::Inactive));
    expect!(setup.backend().is_empty()).to(be_true());
}

#[test]
fn test_close_twice_is_not_active() {
    let ctx = TestContext::new("close_twice");
    let setup = ctx.setup(MemoryBackend::new());
    let device = ctx.new_luks_image(&setup, "dev", "sifra");

    setup.luks_open(&device, "vol", "sifra").unwrap();
    expect!(setup.luks_close("vol")).to(be_ok());
    let second = setup.luks_close("vol");
    assert!(matches!(second, Err(Error::NotActive(_))));
}

#[test]
fn test_open_same_name_twice_is_name_in_use() {
    let ctx = TestContext::new("name_in_use");
    let setup = ctx.setup(MemoryBackend::new());
    let device = ctx.new_luks_image(&setup, "dev", "sifra");

    setup.luks_open(&device, "vol", "sifra").unwrap();
    assert!(matches!(setup.luks_open(&device, "vol", "sifra"), Err(Error::NameInUse(_))));
    expect!(setup.active_names()).to(be_equal_to(vec!["vol".to_string()]));
}

#[test]
fn test_wrong_passphrase_has_no_matching_slot() {
    let ctx = TestContext::new("wrong_passphrase");
    let setup = ctx.setup(MemoryBackend::new());
    let device = ctx.new_luks_image(&setup, "dev", "sifra");

    let res = setup.luks_open(&device, "vol", "hunter2-not-it");
    assert!(matches!(res, Err(Error::NoMatchingSlot)));
    expect!(setup.luks_status("vol")).to(be_equal_to(VolumeStatus::Inactive));
    expect!(setup.backend().is_empty()).to(be_true());

    // the name was released and can be used now
    expect!(setup.luks_open(&device, "vol", "sifra")).to(be_ok().value(0));
}

#[test]
fn test_passphrase_never_logged() {
    let ctx = TestContext::new("no_secret_logs");
    let setup = ctx.setup(MemoryBackend::new());
    let device = ctx.new_luks_image(&setup, "dev", "correct horse battery");

    let _ = setup.luks_open(&device, "vol", "hunter2-not-it");
    setup.luks_open(&device, "vol", "correct horse battery").unwrap();
    setup.luks_close("vol").unwrap();

    let messages = ctx.messages();
    expect!(messages.is_empty()).to(be_false());
    for message in messages {
        assert!(!message.contains("hunter2"), "leaked: {}", message);
        assert!(!message.contains("correct horse"), "leaked: {}", message);
    }
}

#[test]
fn test_failures_are_reported_through_logger() {
    let ctx = TestContext::new("failure_logs");
    let setup = ctx.setup(MemoryBackend::new());

    let _ = setup.luks_close("nothing");
    let records = ctx.records.lock().unwrap();
    expect!(records.len()).to(be_equal_to(1));
    expect!(records[0].0).to(be_equal_to(Priority::Error));
    assert!(records[0].1.contains("nothing"));
}

#[test]
fn test_concurrent_open_of_one_name() {
    let ctx = TestContext::new("concurrent_one_name");
    let setup = ctx.setup(MemoryBackend::new());
    let device = ctx.new_luks_image(&setup, "dev", "sifra");

    let results: Vec<Result<Keyslot>> = thread::scope(|s| {
        let handles: Vec<_> = (0..6).map(|_| s.spawn(|| setup.luks_open(&device, "vol", "sifra"))).collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let opened = results.iter().filter(|r| r.is_ok()).count();
    let in_use = results
        .iter()
        .filter(|r| matches!(r, Err(Error::NameInUse(_))))
        .count();
    expect!(opened).to(be_equal_to(1));
    expect!(in_use).to(be_equal_to(5));
    expect!(setup.active_names()).to(be_equal_to(vec!["vol".to_string()]));
    expect!(setup.backend().len()).to(be_equal_to(1));
}

#[test]
fn test_concurrent_open_of_distinct_names() {
    let ctx = TestContext::new("concurrent_names");
    let setup = ctx.setup(MemoryBackend::new());
    let first = ctx.new_luks_image(&setup, "first", "one");
    let second = ctx.new_luks_image(&setup, "second", "two");

    thread::scope(|s| {
        let a = s.spawn(|| setup.luks_open(&first, "first", "one"));
        let b = s.spawn(|| setup.luks_open(&second, "second", "two"));
        expect!(a.join().unwrap()).to(be_ok());
        expect!(b.join().unwrap()).to(be_ok());
    });
    expect!(setup.active_names()).to(be_equal_to(vec!["first".to_string(), "second".to_string()]));
}

#[test]
fn test_backend_failure_rolls_back_open() {
    let ctx = TestContext::new("open_rollback");
    let backend = FlakyBackend {
        fail_open: true,
        ..FlakyBackend::default()
    };
    let setup = ctx.setup(backend);
    let device = ctx.new_luks_image(&setup, "dev", "sifra");

    let res = setup.luks_open(&device, "vol", "sifra");
    match res {
        Err(Error::ActivationBackendError(e)) => expect!(e.errno().0).to(be_equal_to(1)),
        other => panic!("unexpected result {:?}", other),
    };
    expect!(setup.luks_status("vol")).to(be_equal_to(VolumeStatus::Inactive));
    expect!(setup.active_names().is_empty()).to(be_true());
}

#[test]
fn test_backend_failure_keeps_volume_open() {
    let ctx = TestContext::new("close_failure");
    let setup = ctx.setup(FlakyBackend::default());
    let device = ctx.new_luks_image(&setup, "dev", "sifra");

    setup.luks_open(&device, "vol", "sifra").unwrap();
    setup.backend().fail_close.store(true, Ordering::SeqCst);
    assert!(matches!(setup.luks_close("vol"), Err(Error::ActivationBackendError(_))));
    expect!(setup.luks_status("vol")).to(be_equal_to(VolumeStatus::Active));

    setup.backend().fail_close.store(false, Ordering::SeqCst);
    expect!(setup.luks_close("vol")).to(be_ok());
}

#[test]
fn test_backend_mismatch_is_invalid() {
    let ctx = TestContext::new("invalid");
    let backend = Arc::new(MemoryBackend::new());
    let setup = ctx.setup(Arc::clone(&backend));
    let device = ctx.new_luks_image(&setup, "dev", "sifra");

    setup.luks_open(&device, "vol", "sifra").unwrap();
    backend.set_state("vol", BackendState::Inactive);
    expect!(setup.luks_status("vol")).to(be_equal_to(VolumeStatus::Invalid));
    expect!(setup.luks_status_info("vol").map(|v| v.status)).to(be_some().value(VolumeStatus::Invalid));
    assert!(matches!(setup.luks_open(&device, "vol", "sifra"), Err(Error::NameInUse(_))));

    // the mapping is already gone, so closing only drops the record
    expect!(setup.luks_close("vol")).to(be_ok());
    expect!(setup.luks_status("vol")).to(be_equal_to(VolumeStatus::Inactive));
}

#[test]
fn test_foreign_mapping_blocks_open() {
    let ctx = TestContext::new("foreign_mapping");
    let backend = Arc::new(MemoryBackend::new());
    let setup = ctx.setup(Arc::clone(&backend));
    let device = ctx.new_luks_image(&setup, "dev", "sifra");

    let other = ctx.setup(Arc::clone(&backend));
    other.luks_open(&device, "vol", "sifra").unwrap();

    assert!(matches!(setup.luks_open(&device, "vol", "sifra"), Err(Error::NameInUse(_))));
    expect!(setup.luks_status("vol")).to(be_equal_to(VolumeStatus::Invalid));
}

#[test]
fn test_corrupted_magic_is_not_luks() {
    let ctx = TestContext::new("corrupted_magic");
    let setup = ctx.setup(MemoryBackend::new());
    let device = ctx.new_luks_image(&setup, "dev", "sifra");

    let mut file = OpenOptions::new().write(true).open(&device).unwrap();
    file.write_all(b"XUKS").unwrap();
    drop(file);

    expect!(setup.is_luks(&device)).to(be_false());
    assert!(matches!(setup.luks_uuid(&device), Err(Error::NotLuksFormat)));
    assert!(matches!(setup.luks_open(&device, "vol", "sifra"), Err(Error::NotLuksFormat)));
}

#[test]
fn test_missing_device() {
    let ctx = TestContext::new("missing_device");
    let setup = ctx.setup(MemoryBackend::new());
    let device = ctx.dir.path().join("nope");

    expect!(setup.is_luks(&device)).to(be_false());
    assert!(matches!(setup.luks_uuid(&device), Err(Error::IOError(_))));
}

#[test]
fn test_truncated_header_is_format_error() {
    let ctx = TestContext::new("truncated");
    let setup = ctx.setup(MemoryBackend::new());
    let device = ctx.new_luks_image(&setup, "dev", "sifra");

    let header = head(&device, 300);
    let truncated = ctx.dir.path().join("truncated.image");
    fs::write(&truncated, header).unwrap();

    expect!(setup.is_luks(&truncated)).to(be_false());
    assert!(matches!(setup.luks_uuid(&truncated), Err(Error::FormatError(_))));
}

#[test]
fn test_luks2_is_detected_but_not_opened() {
    let ctx = TestContext::new("luks2");
    let setup = ctx.setup(MemoryBackend::new());
    let device = ctx.new_image("luks2");

    let mut header = vec![0u8; 4096];
    header[..6].copy_from_slice(b"LUKS\xba\xbe");
    header[6..8].copy_from_slice(&2u16.to_be_bytes());
    header[8..16].copy_from_slice(&16384u64.to_be_bytes());
    header[168..168 + SCENARIO_UUID.len()].copy_from_slice(SCENARIO_UUID.as_bytes());
    let mut file = OpenOptions::new().write(true).open(&device).unwrap();
    file.write_all(&header).unwrap();
    drop(file);

    expect!(setup.is_luks(&device)).to(be_true());
    expect!(setup.luks_uuid(&device)).to(be_ok().value(SCENARIO_UUID.to_string()));
    assert!(matches!(
        setup.luks_open(&device, "vol", "sifra"),
        Err(Error::InvalidLuksVersion(2))
    ));
}

#[test]
fn test_format_denied_leaves_device_untouched() {
    let ctx = TestContext::new("format_denied");
    let setup = CryptSetup::new(ctx.logger(), FixedAnswer(false), MemoryBackend::new());
    let device = ctx.new_image("dev");

    let res = setup.luks_format(&device).iterations(10).luks1("sifra");
    assert!(matches!(res, Err(Error::ConfirmationDenied)));
    expect!(head(&device, 8192).iter().all(|&b| b == 0)).to(be_true());
    expect!(setup.is_luks(&device)).to(be_false());
}

#[test]
fn test_format_with_panicking_confirm_is_denied() {
    let ctx = TestContext::new("format_panic");
    let confirm = |_: &str| -> std::result::Result<bool, HandlerError> { panic!("dialog crashed") };
    let setup = CryptSetup::new(ctx.logger(), confirm, MemoryBackend::new());
    let device = ctx.new_image("dev");

    let res = setup.luks_format(&device).iterations(10).luks1("sifra");
    assert!(matches!(res, Err(Error::CallbackError(_))));
    expect!(setup.is_luks(&device)).to(be_false());
}

#[test]
fn test_format_device_too_small() {
    let ctx = TestContext::new("too_small");
    let setup = ctx.setup(MemoryBackend::new());
    let device = ctx.dir.path().join("small.image");
    File::create(&device).unwrap().set_len(1024 * 1024).unwrap();

    let res = setup.luks_format(&device).iterations(10).luks1("sifra");
    assert!(matches!(
        res,
        Err(Error::DeviceTooSmall {
            required: 2097152,
            actual: 1048576
        })
    ));
}

#[test]
fn test_format_xts_512_bit_sha512() {
    let ctx = TestContext::new("xts512");
    let setup = ctx.setup(MemoryBackend::new());
    let device = ctx.new_image("dev");

    let uuid = setup
        .luks_format(&device)
        .cipher("aes", "xts-plain64")
        .key_bits(512)
        .hash("sha512")
        .iterations(10)
        .luks1("sifra")
        .unwrap();

    let params = Luks1Params::from_path(&device).unwrap();
    expect!(*params.uuid()).to(be_equal_to(uuid));
    expect!(params.mk_bits()).to(be_equal_to(512));
    expect!(params.hash_spec()).to(be_equal_to(HashSpec::Sha512));
    expect!(params.mk_iterations()).to(be_equal_to(1000));
    expect!(params.keyslots()[0].is_active()).to(be_true());
    expect!(params.keyslots()[1..].iter().any(|s| s.is_active())).to(be_false());

    expect!(setup.luks_open_read_only(&device, "vol", "sifra")).to(be_ok().value(0));
    expect!(setup.luks_status_info("vol").map(|v| v.read_only)).to(be_some().value(true));
}

#[test]
fn test_format_of_open_device_is_refused() {
    let ctx = TestContext::new("format_busy");
    let setup = ctx.setup(MemoryBackend::new());
    let device = ctx.new_luks_image(&setup, "dev", "sifra");
    setup.luks_open(&device, "vol", "sifra").unwrap();

    let res = setup.luks_format(&device).iterations(10).luks1("other");
    assert!(matches!(res, Err(Error::InvalidArgument(_))));
    expect!(setup.luks_open(&device, "vol2", "sifra")).to(be_ok().value(0));
}

#[test]
fn test_log_and_ask_yes_passthrough() {
    let ctx = TestContext::new("passthrough");
    let setup = ctx.setup(MemoryBackend::new());

    setup.log(Priority::from_int(5), "loguj!");
    expect!(setup.ask_yes("bude zima?")).to(be_ok().value(true));

    let records = ctx.records.lock().unwrap();
    expect!(records.clone()).to(be_equal_to(vec![(Priority::Fatal, "loguj!".to_string())]));
}

#[test]
fn test_open_prebuilt_xts_image() {
    let ctx = TestContext::new("prebuilt_xts");
    let setup = ctx.setup(MemoryBackend::new());
    let device = fixture_image(&ctx, "xts", XTS_FIXTURE);

    expect!(setup.luks_uuid(&device)).to(be_ok().value("5b2f1c7e-3a44-4f0e-9d7b-2c6a1e8f4d90".to_string()));
    assert!(matches!(setup.luks_open(&device, "vol", "Sifra"), Err(Error::NoMatchingSlot)));
    expect!(setup.luks_open(&device, "vol", "sifra")).to(be_ok().value(0));

    let mapping = setup.backend().mapping("vol").expect("backend mapping");
    expect!(mapping.cipher.as_str()).to(be_equal_to("aes-xts-plain64"));
    expect!(mapping.key_bits).to(be_equal_to(512));
    expect!(mapping.payload_offset).to(be_equal_to(4096));
}

#[test]
fn test_open_prebuilt_cbc_essiv_image() {
    let ctx = TestContext::new("prebuilt_essiv");
    let setup = ctx.setup(MemoryBackend::new());
    let device = fixture_image(&ctx, "essiv", ESSIV_FIXTURE);

    expect!(setup.luks_open(&device, "vol", "correct horse battery staple")).to(be_ok().value(0));
    let info = setup.luks_status_info("vol").expect("status info");
    expect!(info.cipher.as_str()).to(be_equal_to("aes-cbc-essiv:sha256"));
    expect!(info.key_bits).to(be_equal_to(256));
}

#[test]
fn test_format_cbc_essiv_then_open() {
    let ctx = TestContext::new("format_essiv");
    let setup = ctx.setup(MemoryBackend::new());
    let device = ctx.new_image("dev");

    setup
        .luks_format(&device)
        .cipher("aes", "cbc-essiv:sha256")
        .hash("sha1")
        .iterations(10)
        .luks1("sifra")
        .unwrap();
    expect!(setup.luks_open(&device, "vol", "sifra")).to(be_ok().value(0));
    expect!(setup.luks_status_info("vol").map(|v| v.cipher)).to(be_some().value("aes-cbc-essiv:sha256".to_string()));
}

#[test]
fn test_huge_stripe_count_is_format_error() {
    let ctx = TestContext::new("huge_stripes");
    let setup = ctx.setup(MemoryBackend::new());
    let device = ctx.new_luks_image(&setup, "dev", "sifra");

    // stripes field of key slot 0
    let mut file = OpenOptions::new().write(true).open(&device).unwrap();
    file.seek(SeekFrom::Start(208 + 44)).unwrap();
    file.write_all(&u32::MAX.to_be_bytes()).unwrap();
    drop(file);

    let res = setup.luks_open(&device, "vol", "sifra");
    assert!(matches!(res, Err(Error::FormatError(_))), "{:?}", res);
    expect!(setup.luks_status("vol")).to(be_equal_to(VolumeStatus::Inactive));
    expect!(setup.backend().is_empty()).to(be_true());
    expect!(setup.is_luks(&device)).to(be_true());
}

#[test]
fn test_format_with_huge_stripe_count_is_refused() {
    let ctx = TestContext::new("format_huge_stripes");
    let setup = ctx.setup(MemoryBackend::new());
    let device = ctx.new_image("dev");

    let res = setup.luks_format(&device).iterations(10).stripes(u32::MAX).luks1("sifra");
    assert!(matches!(res, Err(Error::InvalidArgument(_))));
    expect!(setup.is_luks(&device)).to(be_false());
}

#[test]
fn test_key_file_format_and_open() {
    let ctx = TestContext::new("key_file");
    let setup = ctx.setup(MemoryBackend::new());
    let device = ctx.new_image("dev");
    let keyfile = key_file(&ctx, "key", b"sifra\n");

    setup.luks_format(&device).iterations(10).luks1_keyfile(&keyfile).unwrap();

    // the trailing newline is part of the key
    assert!(matches!(setup.luks_open(&device, "vol", "sifra"), Err(Error::NoMatchingSlot)));
    expect!(setup.luks_open_with_keyfile(&device, "vol", &keyfile)).to(be_ok().value(0));
    setup.luks_close("vol").unwrap();
    expect!(setup.luks_open(&device, "vol", "sifra\n")).to(be_ok().value(0));
}

#[test]
fn test_unreadable_key_file() {
    let ctx = TestContext::new("bad_key_file");
    let setup = ctx.setup(MemoryBackend::new());
    let device = ctx.new_luks_image(&setup, "dev", "sifra");
    let empty = key_file(&ctx, "empty", b"");

    assert!(matches!(
        setup.luks_open_with_keyfile(&device, "vol", &empty),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        setup.luks_open_with_keyfile(&device, "vol", ctx.dir.path().join("missing")),
        Err(Error::IOError(_))
    ));
    expect!(setup.luks_status("vol")).to(be_equal_to(VolumeStatus::Inactive));

    let other = ctx.new_image("other");
    let res = setup.luks_format(&other).iterations(10).luks1_keyfile(&empty);
    assert!(matches!(res, Err(Error::InvalidArgument(_))));
    expect!(setup.is_luks(&other)).to(be_false());
}
