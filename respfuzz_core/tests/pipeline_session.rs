use respfuzz_core::batch::BatchBuilder;
use respfuzz_core::config::{FuzzerConfig, ProtocolVersion};
use respfuzz_core::connection::ConnectionError;
use respfuzz_core::corpus::InMemoryCorpus;
use respfuzz_core::executor::ExecutionError;
use respfuzz_core::mutator::SpecialCharMutator;
use respfuzz_core::runner::{RunError, run};

use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::path::Path;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const CORPUS: &str = "GET k\nSET k v\n";

/// Minimal RESP server for one client. Answers every request with `+OK`, echoes
/// `PING <arg>` as a bulk string and answers `HELLO` with a RESP3 map. After
/// `close_after` replies it half-closes and drains until the client disconnects.
/// A mute server reads every request and never answers.
struct FakeServer {
    port: u16,
    handle: JoinHandle<Vec<Vec<String>>>,
}

impl FakeServer {
    fn start(close_after: Option<usize>) -> Self {
        Self::spawn(move |stream| serve(stream, close_after))
    }

    fn start_mute() -> Self {
        Self::spawn(|stream| {
            let mut reader = BufReader::new(stream);
            std::iter::from_fn(|| read_request(&mut reader)).collect()
        })
    }

    fn spawn<F>(handler: F) -> Self
    where
        F: FnOnce(TcpStream) -> Vec<Vec<String>> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            handler(stream)
        });
        Self { port, handle }
    }

    fn requests(self) -> Vec<Vec<String>> {
        self.handle.join().unwrap()
    }
}

fn read_request(reader: &mut BufReader<TcpStream>) -> Option<Vec<String>> {
    let mut line = String::new();
    if reader.read_line(&mut line).ok()? == 0 {
        return None;
    }
    let count: usize = line.trim_end().strip_prefix('*')?.parse().ok()?;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        line.clear();
        reader.read_line(&mut line).ok()?;
        let len: usize = line.trim_end().strip_prefix('$')?.parse().ok()?;
        let mut data = vec![0u8; len + 2];
        reader.read_exact(&mut data).ok()?;
        data.truncate(len);
        args.push(String::from_utf8(data).ok()?);
    }
    Some(args)
}

fn serve(stream: TcpStream, close_after: Option<usize>) -> Vec<Vec<String>> {
    let mut writer = stream.try_clone().unwrap();
    let mut reader = BufReader::new(stream);
    let mut requests = Vec::new();
    let mut replies = 0;

    while let Some(args) = read_request(&mut reader) {
        requests.push(args.clone());
        if close_after == Some(replies) {
            continue;
        }
        let reply = match args.first().map(|a| a.to_ascii_uppercase()) {
            Some(cmd) if cmd == "HELLO" => b"%1\r\n$5\r\nproto\r\n:3\r\n".to_vec(),
            Some(cmd) if cmd == "PING" && args.len() == 2 => {
                format!("${}\r\n{}\r\n", args[1].len(), args[1]).into_bytes()
            }
            _ => b"+OK\r\n".to_vec(),
        };
        writer.write_all(&reply).unwrap();
        replies += 1;
        if close_after == Some(replies) {
            writer.shutdown(Shutdown::Write).unwrap();
        }
    }
    requests
}

fn write_corpus(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("commands.txt");
    fs::write(&path, CORPUS).unwrap();
    path
}

fn logged_batches(content: &str) -> Vec<(u64, Vec<String>)> {
    let mut batches: Vec<(u64, Vec<String>)> = Vec::new();
    for line in content.lines() {
        if let Some(number) = line.strip_prefix("BATCH NUMBER - ") {
            batches.push((number.parse().unwrap(), Vec::new()));
        } else if !line.is_empty() {
            batches.last_mut().unwrap().1.push(line.to_string());
        }
    }
    batches
}

fn audit_logs_in(dir: &Path) -> Vec<std::path::PathBuf> {
    fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("respfuzz-commands-") && name.ends_with(".log"))
        })
        .collect()
}

fn config_for(port: u16, dir: &Path, batches: u64, seed: u64) -> FuzzerConfig {
    FuzzerConfig {
        target: format!("127.0.0.1:{port}"),
        batches,
        commands_file: write_corpus(dir),
        output_dir: dir.to_path_buf(),
        seed: Some(seed),
        ..FuzzerConfig::default()
    }
}

/// Finds a seed whose first batch has exactly `len` commands, probe included.
fn seed_with_first_batch_len(len: usize, port: u16) -> u64 {
    let corpus = InMemoryCorpus::from_commands(["GET k", "SET k v"]).unwrap();
    (0u64..10_000)
        .find(|seed| {
            let mut rng = ChaCha8Rng::seed_from_u64(*seed);
            let mut builder = BatchBuilder::new(SpecialCharMutator::new(false), port);
            builder.build(1, &corpus, &mut rng).unwrap().len() == len
        })
        .expect("some seed yields the requested batch length")
}

#[test]
fn single_batch_run_logs_exactly_what_was_sent() {
    let dir = tempfile::tempdir().unwrap();
    let server = FakeServer::start(None);
    let port = server.port;
    let config = config_for(port, dir.path(), 1, 42);

    let summary = run(&config).unwrap();
    let requests = server.requests();

    assert_eq!(summary.batches_completed, 1);
    assert_eq!(summary.seed, 42);
    assert_eq!(summary.commands_sent as usize, requests.len());

    let content = fs::read_to_string(&summary.audit_log).unwrap();
    let batches = logged_batches(&content);
    assert_eq!(batches.len(), 1);
    let (number, commands) = &batches[0];
    assert_eq!(*number, 1);
    assert!((2..=11).contains(&commands.len()));
    assert_eq!(commands.last().unwrap(), &format!("PING {port}"));
    for command in &commands[..commands.len() - 1] {
        assert!(command == "GET k" || command == "SET k v", "{command}");
    }

    let sent: Vec<String> = requests.iter().map(|args| args.join(" ")).collect();
    assert_eq!(&sent, commands);
    assert!(content.starts_with("\nBATCH NUMBER - 1\n"));
}

#[test]
fn many_batches_with_mutation_stay_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let server = FakeServer::start(None);
    let mut config = config_for(server.port, dir.path(), 25, 7);
    config.fuzz = true;

    let summary = run(&config).unwrap();
    let requests = server.requests();
    assert_eq!(summary.batches_completed, 25);

    let content = fs::read_to_string(&summary.audit_log).unwrap();
    let batches = logged_batches(&content);
    let numbers: Vec<u64> = batches.iter().map(|(n, _)| *n).collect();
    assert_eq!(numbers, (1..=25).collect::<Vec<_>>());

    let logged: Vec<String> = batches.into_iter().flat_map(|(_, c)| c).collect();
    let sent: Vec<String> = requests.iter().map(|args| args.join(" ")).collect();
    assert_eq!(logged, sent);
}

#[test]
fn connection_drop_mid_batch_ends_run_without_logging_it() {
    let dir = tempfile::tempdir().unwrap();
    let server = FakeServer::start(Some(3));
    let port = server.port;
    let seed = seed_with_first_batch_len(6, port);
    let config = config_for(port, dir.path(), 5, seed);

    let err = run(&config).unwrap_err();
    let requests = server.requests();

    match err {
        RunError::Execution {
            batch: 1,
            completed: 0,
            source: ExecutionError::Reply {
                index: 3,
                expected: 6,
                source,
            },
        } => assert!(
            matches!(source, ConnectionError::Closed | ConnectionError::Io(_)),
            "unexpected cause {source:?}"
        ),
        other => panic!("Expected failure on reply 4 of batch 1, got {other:?}"),
    }
    assert_eq!(requests.len(), 6, "The whole batch was pipelined before reading");

    for log in audit_logs_in(dir.path()) {
        let content = fs::read_to_string(&log).unwrap();
        assert!(logged_batches(&content).is_empty());
    }
    let leftovers: Vec<_> = fs::read_dir(std::env::temp_dir())
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
        .filter(|entry| {
            fs::read_to_string(entry.path())
                .map(|c| c.ends_with(&format!("PING {port}\n")))
                .unwrap_or(false)
        })
        .collect();
    assert!(leftovers.is_empty(), "Scratch file must be removed on failure");
}

#[test]
fn silent_server_times_out_on_first_reply_without_logging() {
    let dir = tempfile::tempdir().unwrap();
    let server = FakeServer::start_mute();
    let mut config = config_for(server.port, dir.path(), 3, 11);
    config.timeout_ms = 200;

    let started = Instant::now();
    let err = run(&config).unwrap_err();
    let elapsed = started.elapsed();
    let requests = server.requests();

    match err {
        RunError::Execution {
            batch: 1,
            completed: 0,
            source: ExecutionError::Reply { index: 0, source, .. },
        } => assert!(
            matches!(source, ConnectionError::Io(_)),
            "unexpected cause {source:?}"
        ),
        other => panic!("Expected a timeout on the first reply of batch 1, got {other:?}"),
    }
    assert!(elapsed < Duration::from_secs(5), "Took {elapsed:?}");
    assert!((2..=11).contains(&requests.len()));

    for log in audit_logs_in(dir.path()) {
        let content = fs::read_to_string(&log).unwrap();
        assert!(logged_batches(&content).is_empty());
    }
}

#[test]
fn resp3_run_negotiates_before_first_batch() {
    let dir = tempfile::tempdir().unwrap();
    let server = FakeServer::start(None);
    let mut config = config_for(server.port, dir.path(), 2, 3);
    config.protocol = ProtocolVersion::Resp3;

    let summary = run(&config).unwrap();
    let requests = server.requests();

    assert_eq!(requests[0], vec!["HELLO".to_string(), "3".to_string()]);
    assert_eq!(summary.commands_sent as usize, requests.len() - 1);
}

#[test]
fn unreachable_target_is_a_startup_error() {
    let dir = tempfile::tempdir().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    let config = config_for(port, dir.path(), 1, 1);

    let err = run(&config).unwrap_err();
    assert!(matches!(err, RunError::Connect(ConnectionError::Connect { .. })));
    assert!(audit_logs_in(dir.path()).is_empty());
}
