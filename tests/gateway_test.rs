//! Redis gateways against a scripted RESP server on a local socket.
//!
//! The server understands just enough of the protocol to answer LPUSH,
//! LREM and BRPOPLPUSH, and acknowledges anything else (connection setup)
//! with `+OK`. Each connection is served on its own thread.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use redis_message_queue::{
    AsyncGateway, AsyncMessageQueue, AsyncRedisGateway, Gateway, GatewayOptions, RedisGateway,
    RetryPolicy,
};

#[derive(Clone, Copy, Default)]
struct Script {
    /// Close the first connection right after answering its first LPUSH.
    drop_first_connection: bool,
    /// How long BRPOPLPUSH holds its connection before answering nil.
    block_for: Duration,
}

struct FakeRedis {
    addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    lpushes: Arc<AtomicUsize>,
}

impl FakeRedis {
    fn start(script: Script) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let lpushes = Arc::new(AtomicUsize::new(0));

        let accepted = Arc::clone(&connections);
        let pushed = Arc::clone(&lpushes);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { continue };
                let index = accepted.fetch_add(1, Ordering::SeqCst);
                let pushed = Arc::clone(&pushed);
                thread::spawn(move || serve(stream, index, script, &pushed));
            }
        });

        Self {
            addr,
            connections,
            lpushes,
        }
    }

    fn client(&self) -> redis::Client {
        redis::Client::open(format!("redis://{}/", self.addr)).unwrap()
    }

    fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    fn lpushes(&self) -> usize {
        self.lpushes.load(Ordering::SeqCst)
    }
}

fn read_line(reader: &mut impl BufRead, prefix: char) -> io::Result<Option<usize>> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    line.trim_end()
        .strip_prefix(prefix)
        .and_then(|n| n.parse().ok())
        .map(Some)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, line.clone()))
}

fn read_command(reader: &mut impl BufRead) -> io::Result<Option<Vec<String>>> {
    let Some(count) = read_line(reader, '*')? else {
        return Ok(None);
    };
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        let len = read_line(reader, '$')?.ok_or(io::ErrorKind::UnexpectedEof)?;
        let mut buf = vec![0; len + 2];
        reader.read_exact(&mut buf)?;
        buf.truncate(len);
        args.push(String::from_utf8_lossy(&buf).into_owned());
    }
    Ok(Some(args))
}

fn serve(stream: TcpStream, index: usize, script: Script, lpushes: &AtomicUsize) {
    let mut writer = stream.try_clone().unwrap();
    let mut reader = BufReader::new(stream);
    while let Ok(Some(args)) = read_command(&mut reader) {
        let command = args[0].to_ascii_uppercase();
        let reply: &[u8] = match command.as_str() {
            "LPUSH" => {
                lpushes.fetch_add(1, Ordering::SeqCst);
                b":1\r\n"
            }
            "LREM" => b":1\r\n",
            "BRPOPLPUSH" => {
                thread::sleep(script.block_for);
                b"*-1\r\n"
            }
            _ => b"+OK\r\n",
        };
        if writer.write_all(reply).is_err() {
            return;
        }
        if command == "LPUSH" && script.drop_first_connection && index == 0 {
            let _ = writer.shutdown(Shutdown::Both);
            return;
        }
    }
}

fn options() -> GatewayOptions {
    GatewayOptions {
        retry: RetryPolicy::default()
            .initial_interval(Duration::from_millis(5))
            .max_interval(Duration::from_millis(50))
            .max_elapsed(Duration::from_secs(5)),
        message_wait_interval: Duration::from_secs(1),
        ..GatewayOptions::default()
    }
}

#[test]
fn blocking_gateway_reconnects_after_the_server_drops_it() {
    let server = FakeRedis::start(Script {
        drop_first_connection: true,
        ..Script::default()
    });
    let mut gateway = RedisGateway::connect(&server.client(), options()).unwrap();

    gateway.append("jobs::pending", b"first").unwrap();
    gateway.append("jobs::pending", b"second").unwrap();

    assert_eq!(server.lpushes(), 2);
    assert_eq!(server.connections(), 2);
}

#[tokio::test]
async fn async_gateway_reconnects_after_the_server_drops_it() {
    let server = FakeRedis::start(Script {
        drop_first_connection: true,
        ..Script::default()
    });
    let gateway = AsyncRedisGateway::connect(&server.client(), options())
        .await
        .unwrap();

    gateway.append("jobs::pending", b"first").await.unwrap();
    gateway.append("jobs::pending", b"second").await.unwrap();

    assert_eq!(server.lpushes(), 2);
    assert!(server.connections() >= 2);
}

#[tokio::test]
async fn waiting_consumer_does_not_hold_up_publishers() {
    let server = FakeRedis::start(Script {
        block_for: Duration::from_secs(1),
        ..Script::default()
    });
    let queue = AsyncMessageQueue::builder("jobs")
        .deduplication(false)
        .message_wait_interval(Duration::from_secs(1))
        .client(server.client())
        .build_async()
        .await
        .unwrap();

    let consumer = queue.clone();
    let waiting = tokio::spawn(async move {
        consumer
            .process_message(|m| async move { Ok::<_, String>(m) })
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    assert!(queue.publish("Hello").await.unwrap());
    let publish_took = started.elapsed();

    assert!(
        publish_took < Duration::from_millis(500),
        "publish waited {publish_took:?} behind a blocked dequeue"
    );
    assert_eq!(server.lpushes(), 1);
    assert_eq!(waiting.await.unwrap().unwrap(), None);
}

#[tokio::test]
async fn wait_connections_are_reused() {
    let server = FakeRedis::start(Script {
        block_for: Duration::from_millis(20),
        ..Script::default()
    });
    let gateway = AsyncRedisGateway::connect(&server.client(), options())
        .await
        .unwrap();

    for _ in 0..3 {
        let moved = gateway
            .wait_and_move("jobs::pending", "jobs::processing")
            .await
            .unwrap();
        assert_eq!(moved, None);
    }

    // One managed connection plus one for waiting.
    assert_eq!(server.connections(), 2);
}
