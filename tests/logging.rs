use delver::logging;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capture(ansi: bool) -> String {
    let out = Captured::default();
    let writer = out.clone();
    let subscriber = logging::subscriber("info", ansi, move || writer.clone());
    tracing::subscriber::with_default(subscriber, || {
        tracing::warn!(path = "/tmp/r.csv", "cannot write report");
        tracing::debug!("filtered out");
    });
    let bytes = out.0.lock().unwrap().clone();
    String::from_utf8(bytes).unwrap()
}

#[test]
fn plain_output_has_no_escape_codes() {
    let text = capture(false);
    assert!(text.contains("WARN"), "{text}");
    assert!(text.contains("cannot write report"), "{text}");
    assert!(text.contains("path=\"/tmp/r.csv\""), "{text}");
    assert!(!text.contains('\x1b'), "{text:?}");
    assert!(!text.contains("filtered out"));
}

#[test]
fn init_twice_keeps_the_first_subscriber() {
    logging::init("info");
    logging::init("debug");
}
