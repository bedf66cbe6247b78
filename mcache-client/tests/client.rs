use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use mcache_client::{
    Client, ClientConfig, Context, Item, McError, MetaArithmeticFlags, MetaArithmeticMode, MetaDeleteFlags,
    MetaGetFlags, MetaSetFlags, PoolStats,
};

enum Reply {
    Bytes(&'static [u8]),
    /// Drops the connection without answering.
    Close,
    /// Sleeps, then drops the connection.
    Stall(Duration),
}

type Step = (&'static str, Reply);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Serves `script` in order across as many connections as the client opens.
///
/// Each step asserts the exact request bytes, data block included. The
/// handle yields the number of steps served.
fn spawn_server(script: Vec<Step>) -> (String, thread::JoinHandle<usize>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();

    let handle = thread::spawn(move || {
        let mut step = 0;
        while step < script.len() {
            let (stream, _) = listener.accept().expect("accept");
            let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
            let mut reader = BufReader::new(stream.try_clone().expect("clone"));
            let mut writer = stream;

            while step < script.len() {
                let Some(request) = read_request(&mut reader).expect("read request") else {
                    break;
                };
                if request == b"quit\r\n" {
                    break;
                }
                let (expected, reply) = &script[step];
                assert_eq!(String::from_utf8_lossy(&request), *expected, "step {step}");
                step += 1;
                match reply {
                    Reply::Bytes(data) => {
                        writer.write_all(data).expect("reply");
                        writer.flush().expect("flush");
                    }
                    Reply::Close => break,
                    Reply::Stall(pause) => {
                        thread::sleep(*pause);
                        break;
                    }
                }
            }
        }
        step
    });

    (addr, handle)
}

fn read_request(reader: &mut BufReader<TcpStream>) -> io::Result<Option<Vec<u8>>> {
    let mut request = Vec::new();
    if reader.read_until(b'\n', &mut request)? == 0 {
        return Ok(None);
    }
    if let Some(len) = data_block_len(&request) {
        let mut block = vec![0u8; len + 2];
        reader.read_exact(&mut block)?;
        request.extend_from_slice(&block);
    }
    Ok(Some(request))
}

fn data_block_len(line: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(line).ok()?;
    let fields: Vec<&str> = text.split_whitespace().collect();
    let idx = match *fields.first()? {
        "set" | "add" | "replace" | "append" | "prepend" | "cas" => 4,
        "ms" => 2,
        _ => return None,
    };
    fields.get(idx)?.parse().ok()
}

fn test_config() -> ClientConfig {
    ClientConfig {
        dial_timeout: Duration::from_secs(1),
        read_timeout: Duration::from_secs(1),
        write_timeout: Duration::from_secs(1),
        max_conns: 2,
        max_idle_conns: 2,
        ..ClientConfig::default()
    }
}

fn client_for(addrs: &str) -> Client {
    init_tracing();
    Client::new(addrs, test_config()).expect("client")
}

fn ctx() -> Context {
    Context::background().with_timeout(Duration::from_secs(2))
}

/// Polls the single pool until `done` holds or `limit` elapses.
fn wait_for_pool(client: &Client, limit: Duration, done: impl Fn(&PoolStats) -> bool) -> PoolStats {
    let start = Instant::now();
    loop {
        let stats = client.pool_stats()[0].1;
        if done(&stats) || start.elapsed() > limit {
            return stats;
        }
        thread::sleep(Duration::from_millis(50));
    }
}

fn pool_totals(client: &Client) -> (usize, usize) {
    client
        .pool_stats()
        .iter()
        .fold((0, 0), |(total, idle), (_, stats)| (total + stats.total, idle + stats.idle))
}

#[test]
fn version_single_server() {
    let (addr, server) = spawn_server(vec![("version\r\n", Reply::Bytes(b"VERSION 1.6.14\r\n"))]);
    let client = client_for(&addr);

    assert_eq!(client.version(&ctx()).unwrap(), "1.6.14");
    assert_eq!(server.join().unwrap(), 1);
}

#[test]
fn set_then_get_reuses_one_connection() {
    let (addr, server) = spawn_server(vec![
        ("set foo 0 0 3\r\nbar\r\n", Reply::Bytes(b"STORED\r\n")),
        ("get foo\r\n", Reply::Bytes(b"VALUE foo 0 3\r\nbar\r\nEND\r\n")),
    ]);
    let client = client_for(&addr);
    let ctx = ctx();

    client.set(&ctx, "foo", b"bar", 0, 0).unwrap();
    let item = client.get(&ctx, "foo").unwrap();
    assert_eq!(
        item,
        Item {
            key: "foo".into(),
            value: "bar".into(),
            flags: 0,
            cas: 0,
        }
    );
    assert_eq!(pool_totals(&client), (1, 1));
    assert_eq!(server.join().unwrap(), 2);
}

#[test]
fn values_with_line_breaks_round_trip() {
    let (addr, server) = spawn_server(vec![
        ("set blob 7 60 4\r\na\r\nb\r\n", Reply::Bytes(b"STORED\r\n")),
        ("get blob\r\n", Reply::Bytes(b"VALUE blob 7 4\r\na\r\nb\r\nEND\r\n")),
    ]);
    let client = client_for(&addr);
    let ctx = ctx();

    client.set(&ctx, "blob", b"a\r\nb", 7, 60).unwrap();
    let item = client.get(&ctx, "blob").unwrap();
    assert_eq!(item.value.as_ref(), b"a\r\nb");
    assert_eq!(item.flags, 7);
    server.join().unwrap();
}

#[test]
fn gets_then_cas_collision() {
    let (addr, server) = spawn_server(vec![
        ("gets foo\r\n", Reply::Bytes(b"VALUE foo 0 3 42\r\nbar\r\nEND\r\n")),
        ("cas foo 0 0 3 42\r\nbaz\r\n", Reply::Bytes(b"STORED\r\n")),
        ("cas foo 0 0 3 42\r\nqux\r\n", Reply::Bytes(b"EXISTS\r\n")),
    ]);
    let client = client_for(&addr);
    let ctx = ctx();

    let items = client.gets(&ctx, &["foo"]).unwrap();
    assert_eq!(items.len(), 1);
    let cas = items[0].cas;
    assert_eq!(cas, 42);

    client.cas(&ctx, "foo", b"baz", 0, 0, cas).unwrap();
    let err = client.cas(&ctx, "foo", b"qux", 0, 0, cas).unwrap_err();
    assert!(matches!(err, McError::Exists), "{err}");
    assert_eq!(pool_totals(&client), (1, 1));
    server.join().unwrap();
}

#[test]
fn multi_key_gets_routes_to_one_server() {
    let (addr, server) = spawn_server(vec![(
        "gets a b\r\n",
        Reply::Bytes(b"VALUE a 1 1 10\r\nx\r\nVALUE b 2 2 11\r\nyy\r\nEND\r\n"),
    )]);
    let client = client_for(&addr);

    let items = client.gets(&ctx(), &["a", "b"]).unwrap();
    let keys: Vec<_> = items.iter().map(|i| (i.key.as_str(), i.cas)).collect();
    assert_eq!(keys, vec![("a", 10), ("b", 11)]);
    server.join().unwrap();
}

#[test]
fn replace_append_prepend() {
    let (addr, server) = spawn_server(vec![
        ("replace foo 0 0 3\r\nbar\r\n", Reply::Bytes(b"NOT_STORED\r\n")),
        ("set foo 0 0 3\r\nbar\r\n", Reply::Bytes(b"STORED\r\n")),
        ("append foo 0 0 1\r\n!\r\n", Reply::Bytes(b"STORED\r\n")),
        ("prepend foo 0 0 1\r\n<\r\n", Reply::Bytes(b"STORED\r\n")),
        ("replace foo 5 0 3\r\nbaz\r\n", Reply::Bytes(b"STORED\r\n")),
        ("get foo\r\n", Reply::Bytes(b"VALUE foo 5 3\r\nbaz\r\nEND\r\n")),
    ]);
    let client = client_for(&addr);
    let ctx = ctx();

    assert!(matches!(client.replace(&ctx, "foo", b"bar", 0, 0), Err(McError::NotStored)));
    client.set(&ctx, "foo", b"bar", 0, 0).unwrap();
    client.append(&ctx, "foo", b"!", 0, 0).unwrap();
    client.prepend(&ctx, "foo", b"<", 0, 0).unwrap();
    client.replace(&ctx, "foo", b"baz", 5, 0).unwrap();
    let item = client.get(&ctx, "foo").unwrap();
    assert_eq!((item.value.as_ref(), item.flags), (&b"baz"[..], 5));
    assert_eq!(pool_totals(&client), (1, 1));
    assert_eq!(server.join().unwrap(), 6);
}

#[test]
fn get_and_touch_places_exptime_first() {
    let (addr, server) = spawn_server(vec![
        ("gat 300 foo\r\n", Reply::Bytes(b"VALUE foo 0 3\r\nbar\r\nEND\r\n")),
        ("gats 300 foo\r\n", Reply::Bytes(b"END\r\n")),
    ]);
    let client = client_for(&addr);
    let ctx = ctx();

    assert_eq!(client.gat(&ctx, 300, "foo").unwrap().value.as_ref(), b"bar");
    assert!(matches!(client.gats(&ctx, 300, &["foo"]), Err(McError::NotFound)));
    server.join().unwrap();
}

#[test]
fn delete_then_delete_missing_keeps_connection() {
    let (addr, server) = spawn_server(vec![
        ("delete foo\r\n", Reply::Bytes(b"DELETED\r\n")),
        ("delete foo\r\n", Reply::Bytes(b"NOT_FOUND\r\n")),
    ]);
    let client = client_for(&addr);
    let ctx = ctx();

    client.delete(&ctx, "foo").unwrap();
    assert!(matches!(client.delete(&ctx, "foo"), Err(McError::NotFound)));
    assert_eq!(pool_totals(&client), (1, 1));
    server.join().unwrap();
}

#[test]
fn get_missing_is_not_found() {
    let (addr, server) = spawn_server(vec![("get nope\r\n", Reply::Bytes(b"END\r\n"))]);
    let client = client_for(&addr);

    assert!(matches!(client.get(&ctx(), "nope"), Err(McError::NotFound)));
    server.join().unwrap();
}

#[test]
fn touch_incr_decr() {
    let (addr, server) = spawn_server(vec![
        ("touch foo 10\r\n", Reply::Bytes(b"TOUCHED\r\n")),
        ("incr n 5\r\n", Reply::Bytes(b"15\r\n")),
        ("decr n 6\r\n", Reply::Bytes(b"9 \r\n")),
        ("incr absent 1\r\n", Reply::Bytes(b"NOT_FOUND\r\n")),
    ]);
    let client = client_for(&addr);
    let ctx = ctx();

    client.touch(&ctx, "foo", 10).unwrap();
    assert_eq!(client.incr(&ctx, "n", 5).unwrap(), 15);
    assert_eq!(client.decr(&ctx, "n", 6).unwrap(), 9);
    assert!(matches!(client.incr(&ctx, "absent", 1), Err(McError::NotFound)));
    server.join().unwrap();
}

#[test]
fn server_errors_keep_connection() {
    let (addr, server) = spawn_server(vec![
        ("set big 0 0 1\r\nx\r\n", Reply::Bytes(b"SERVER_ERROR out of memory storing object\r\n")),
        ("add foo 0 0 1\r\nx\r\n", Reply::Bytes(b"NOT_STORED\r\n")),
        ("set foo 0 0 1\r\nx\r\n", Reply::Bytes(b"STORED\r\n")),
    ]);
    let client = client_for(&addr);
    let ctx = ctx();

    let err = client.set(&ctx, "big", b"x", 0, 0).unwrap_err();
    assert!(matches!(err, McError::ServerError(ref m) if m == "out of memory storing object"), "{err}");
    assert!(matches!(client.add(&ctx, "foo", b"x", 0, 0), Err(McError::NotStored)));
    client.set(&ctx, "foo", b"x", 0, 0).unwrap();
    assert_eq!(pool_totals(&client), (1, 1));
    server.join().unwrap();
}

#[test]
fn no_reply_mode_skips_reading() {
    let (addr, server) = spawn_server(vec![
        ("set foo 0 0 3 noreply\r\nbar\r\n", Reply::Bytes(b"")),
        ("incr n 1 noreply\r\n", Reply::Bytes(b"")),
        ("get foo\r\n", Reply::Bytes(b"VALUE foo 0 3\r\nbar\r\nEND\r\n")),
    ]);
    init_tracing();
    let config = ClientConfig {
        no_reply: true,
        ..test_config()
    };
    let client = Client::new(&addr, config).unwrap();
    let ctx = ctx();

    client.set(&ctx, "foo", b"bar", 0, 0).unwrap();
    assert_eq!(client.incr(&ctx, "n", 1).unwrap(), 0);
    assert_eq!(client.get(&ctx, "foo").unwrap().value.as_ref(), b"bar");
    server.join().unwrap();
}

#[test]
fn stats_decodes_typed_fields() {
    let (addr, server) = spawn_server(vec![(
        "stats\r\n",
        Reply::Bytes(b"STAT pid 4242\r\nSTAT version 1.6.14\r\nSTAT curr_connections 3\r\nEND\r\n"),
    )]);
    let client = client_for(&addr);

    let stats = client.stats(&ctx(), None).unwrap();
    assert_eq!(stats.pid, 4242);
    assert_eq!(stats.version, "1.6.14");
    assert_eq!(stats.curr_connections, 3);
    server.join().unwrap();
}

#[test]
fn meta_get_with_base64_key() {
    let (addr, server) = spawn_server(vec![("mg Zm9v b c k v\r\n", Reply::Bytes(b"VA 3 c29 kZm9v\r\nbar\r\n"))]);
    let client = client_for(&addr);

    let flags = MetaGetFlags {
        binary_key: true,
        return_cas: true,
        return_key: true,
        return_value: true,
        ..Default::default()
    };
    let item = client.meta_get(&ctx(), b"foo", &flags).unwrap();
    assert_eq!(item.value.as_ref(), b"bar");
    assert_eq!(item.cas, 29);
    // The echoed key keeps its wire form.
    assert_eq!(item.key.as_ref(), b"Zm9v");
    server.join().unwrap();
}

#[test]
fn meta_get_miss_keeps_connection() {
    let (addr, server) = spawn_server(vec![
        ("mg foo v\r\n", Reply::Bytes(b"EN\r\n")),
        ("mg foo v\r\n", Reply::Bytes(b"VA 1\r\nx\r\n")),
    ]);
    let client = client_for(&addr);
    let ctx = ctx();
    let flags = MetaGetFlags {
        return_value: true,
        ..Default::default()
    };

    assert!(matches!(client.meta_get(&ctx, b"foo", &flags), Err(McError::NotFound)));
    assert_eq!(client.meta_get(&ctx, b"foo", &flags).unwrap().value.as_ref(), b"x");
    assert_eq!(pool_totals(&client), (1, 1));
    server.join().unwrap();
}

#[test]
fn quiet_meta_get_hit_leaves_stream_aligned() {
    let (addr, server) = spawn_server(vec![
        ("mg foo q v\r\n", Reply::Bytes(b"VA 3\r\nbar\r\n")),
        ("mn\r\n", Reply::Bytes(b"MN\r\n")),
        ("mg foo q v\r\n", Reply::Bytes(b"")),
        ("mn\r\n", Reply::Bytes(b"MN\r\n")),
        ("get other\r\n", Reply::Bytes(b"END\r\n")),
    ]);
    init_tracing();
    let config = ClientConfig {
        max_conns: 1,
        max_idle_conns: 1,
        ..test_config()
    };
    let client = Client::new(&addr, config).unwrap();
    let ctx = ctx();
    let flags = MetaGetFlags {
        no_reply: true,
        return_value: true,
        ..Default::default()
    };

    assert_eq!(client.meta_get(&ctx, b"foo", &flags).unwrap().value.as_ref(), b"bar");
    // A suppressed miss comes back as an empty item.
    assert!(client.meta_get(&ctx, b"foo", &flags).unwrap().value.is_empty());
    assert!(matches!(client.get(&ctx, "other"), Err(McError::NotFound)));
    assert_eq!(pool_totals(&client), (1, 1));
    assert_eq!(server.join().unwrap(), 5);
}

#[test]
fn quiet_meta_set_reports_failures_only() {
    let (addr, server) = spawn_server(vec![
        ("ms foo 3 q\r\nbar\r\n", Reply::Bytes(b"")),
        ("mn\r\n", Reply::Bytes(b"MN\r\n")),
        ("ms foo 3 q ME\r\nbar\r\n", Reply::Bytes(b"NS\r\n")),
        ("mn\r\n", Reply::Bytes(b"MN\r\n")),
        ("version\r\n", Reply::Bytes(b"VERSION 1.6.14\r\n")),
    ]);
    let client = client_for(&addr);
    let ctx = ctx();
    let mut flags = MetaSetFlags {
        no_reply: true,
        ..Default::default()
    };

    assert!(client.meta_set(&ctx, b"foo", b"bar", &flags).unwrap().value.is_empty());
    flags.mode = Some(mcache_client::MetaSetMode::Add);
    assert!(matches!(client.meta_set(&ctx, b"foo", b"bar", &flags), Err(McError::NotStored)));
    assert_eq!(client.version(&ctx).unwrap(), "1.6.14");
    assert_eq!(pool_totals(&client), (1, 1));
    server.join().unwrap();
}

#[test]
fn meta_delete_outcomes() {
    let (addr, server) = spawn_server(vec![
        ("md foo C9 k\r\n", Reply::Bytes(b"HD kfoo\r\n")),
        ("md foo C9 k\r\n", Reply::Bytes(b"NF\r\n")),
        ("md foo I T30\r\n", Reply::Bytes(b"EX\r\n")),
    ]);
    let client = client_for(&addr);
    let ctx = ctx();
    let flags = MetaDeleteFlags {
        compare_cas: 9,
        return_key: true,
        ..Default::default()
    };

    assert_eq!(client.meta_delete(&ctx, b"foo", &flags).unwrap().key.as_ref(), b"foo");
    assert!(matches!(client.meta_delete(&ctx, b"foo", &flags), Err(McError::NotFound)));
    let stale = MetaDeleteFlags {
        invalidate: true,
        ttl: 30,
        ..Default::default()
    };
    assert!(matches!(client.meta_delete(&ctx, b"foo", &stale), Err(McError::Exists)));
    assert_eq!(pool_totals(&client), (1, 1));
    server.join().unwrap();
}

#[test]
fn meta_set_returns_header_flags() {
    let (addr, server) = spawn_server(vec![("ms foo 3 c T60\r\nbar\r\n", Reply::Bytes(b"HD c7\r\n"))]);
    let client = client_for(&addr);

    let flags = MetaSetFlags {
        return_cas: true,
        ttl: 60,
        ..Default::default()
    };
    let item = client.meta_set(&ctx(), b"foo", b"bar", &flags).unwrap();
    assert_eq!(item.cas, 7);
    assert!(item.value.is_empty());
    server.join().unwrap();
}

#[test]
fn meta_arithmetic_vivifies() {
    let (addr, server) = spawn_server(vec![(
        "ma foo N10 J200 D100 MI c v\r\n",
        Reply::Bytes(b"VA 3 c56\r\n200\r\n"),
    )]);
    let client = client_for(&addr);

    let flags = MetaArithmeticFlags {
        vivify_ttl: 10,
        initial: 200,
        delta: 100,
        mode: Some(MetaArithmeticMode::Incr),
        return_cas: true,
        return_value: true,
        ..Default::default()
    };
    let item = client.meta_arithmetic(&ctx(), b"foo", &flags).unwrap();
    assert_eq!(item.value.as_ref(), b"200");
    assert_eq!(item.cas, 56);
    server.join().unwrap();
}

#[test]
fn flush_all_reports_failing_node() {
    let (healthy, server_a) = spawn_server(vec![("flush_all\r\n", Reply::Bytes(b"OK\r\n"))]);
    let (failing, server_b) = spawn_server(vec![("flush_all\r\n", Reply::Close)]);
    let client = client_for(&format!("{healthy},{failing}"));

    let err = client.flush_all(&ctx()).unwrap_err();
    let McError::Multi(multi) = err else {
        panic!("expected a multi error, got {err}");
    };
    assert_eq!(multi.len(), 1);
    assert_eq!(multi.errors()[0].addr, format!("tcp://{failing}"));
    assert!(matches!(multi.errors()[0].error, McError::Io(_)));

    server_a.join().unwrap();
    server_b.join().unwrap();
}

#[test]
fn version_broadcast_succeeds_on_every_node() {
    let (a, server_a) = spawn_server(vec![("version\r\n", Reply::Bytes(b"VERSION 1.6.14\r\n"))]);
    let (b, server_b) = spawn_server(vec![("version\r\n", Reply::Bytes(b"VERSION 1.6.21\r\n"))]);
    let client = client_for(&format!("{a},{b}"));

    assert_eq!(client.version(&ctx()).unwrap(), "1.6.14");
    assert_eq!(client.pool_stats().len(), 2);
    server_a.join().unwrap();
    server_b.join().unwrap();
}

#[test]
fn cleaner_retires_idle_connections() {
    let (addr, server) = spawn_server(vec![("version\r\n", Reply::Bytes(b"VERSION 1.6.14\r\n"))]);
    init_tracing();
    let config = ClientConfig {
        max_idle_timeout: Duration::from_secs(1),
        ..test_config()
    };
    let client = Client::new(&addr, config).unwrap();

    client.version(&ctx()).unwrap();
    assert_eq!(pool_totals(&client), (1, 1));
    let stats = wait_for_pool(&client, Duration::from_secs(4), |s| s.total == 0);
    assert_eq!((stats.total, stats.idle), (0, 0));
    assert_eq!(stats.max_idle_time_closed, 1);
    assert_eq!(stats.max_lifetime_closed, 0);
    server.join().unwrap();
}

#[test]
fn cleaner_retires_old_connections() {
    let (addr, server) = spawn_server(vec![("version\r\n", Reply::Bytes(b"VERSION 1.6.14\r\n"))]);
    init_tracing();
    let config = ClientConfig {
        max_lifetime: Duration::from_secs(1),
        ..test_config()
    };
    let client = Client::new(&addr, config).unwrap();

    client.version(&ctx()).unwrap();
    let stats = wait_for_pool(&client, Duration::from_secs(4), |s| s.total == 0);
    assert_eq!(stats.total, 0);
    assert_eq!(stats.max_lifetime_closed, 1);
    assert_eq!(stats.max_idle_time_closed, 0);
    server.join().unwrap();
}

#[test]
fn deadline_exceeded_discards_connection() {
    let (addr, server) = spawn_server(vec![
        ("get slow\r\n", Reply::Stall(Duration::from_millis(400))),
        ("get fast\r\n", Reply::Bytes(b"VALUE fast 0 1\r\nx\r\nEND\r\n")),
    ]);
    let client = client_for(&addr);

    let short = Context::background().with_timeout(Duration::from_millis(100));
    let err = client.get(&short, "slow").unwrap_err();
    assert!(matches!(err, McError::DeadlineExceeded), "{err}");
    assert_eq!(pool_totals(&client), (0, 0));

    assert_eq!(client.get(&ctx(), "fast").unwrap().value.as_ref(), b"x");
    assert_eq!(server.join().unwrap(), 2);
}

#[test]
fn malformed_length_discards_connection() {
    let (addr, server) = spawn_server(vec![("get foo\r\n", Reply::Bytes(b"VALUE foo 0 5\r\nbar\r\nEND\r\n"))]);
    let client = client_for(&addr);

    let err = client.get(&ctx(), "foo").unwrap_err();
    assert!(matches!(err, McError::MalformedResponse(_)), "{err}");
    assert_eq!(pool_totals(&client), (0, 0));
    server.join().unwrap();
}

#[test]
fn unknown_command_is_nonexistent() {
    let (addr, server) = spawn_server(vec![("version\r\n", Reply::Bytes(b"ERROR\r\n"))]);
    let client = client_for(&addr);

    let McError::Multi(multi) = client.version(&ctx()).unwrap_err() else {
        panic!("expected a multi error");
    };
    assert!(matches!(multi.errors()[0].error, McError::NonexistentCommand));
    server.join().unwrap();
}

#[test]
fn empty_address_is_invalid() {
    init_tracing();
    assert!(matches!(Client::connect(""), Err(McError::InvalidAddress(_))));
    assert!(matches!(Client::connect("udp://127.0.0.1:11211"), Err(McError::InvalidAddress(_))));
}

#[test]
fn dial_failure_surfaces_io_error() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);
    let client = client_for(&addr);

    assert!(matches!(client.get(&ctx(), "foo"), Err(McError::Io(_))));
    assert_eq!(pool_totals(&client), (0, 0));
}

#[test]
fn close_rejects_later_calls() {
    let (addr, server) = spawn_server(vec![("set foo 0 0 1\r\nx\r\n", Reply::Bytes(b"STORED\r\n"))]);
    let client = client_for(&addr);

    client.set(&ctx(), "foo", b"x", 0, 0).unwrap();
    client.close().unwrap();
    assert!(matches!(client.get(&ctx(), "foo"), Err(McError::PoolClosed)));
    server.join().unwrap();
}

#[cfg(unix)]
#[test]
fn unix_socket_transport() {
    use std::os::unix::net::UnixListener;

    init_tracing();
    let path = std::env::temp_dir().join(format!("mcache-client-{}.sock", std::process::id()));
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path).unwrap();
    let server = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, "version\r\n");
        (&stream).write_all(b"VERSION 1.6.14\r\n").unwrap();
    });

    let client = Client::new(&format!("unix://{}", path.display()), test_config()).unwrap();
    assert_eq!(client.version(&ctx()).unwrap(), "1.6.14");
    server.join().unwrap();
    drop(client);
    let _ = std::fs::remove_file(&path);
}
