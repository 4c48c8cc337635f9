#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, Instant};

/// A minimal RESP2 server covering the commands `RedisCache` issues.
///
/// Strings and lists live in memory. `BLMOVE` honours its block timeout the
/// way Redis does, replying nil only once the full timeout has elapsed.
#[derive(Clone)]
pub struct FakeRedis {
    addr: SocketAddr,
    data: Data,
}

#[derive(Clone, Default)]
struct Data {
    inner: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    strings: HashMap<String, String>,
    lists: HashMap<String, VecDeque<String>>,
    commands: Vec<String>,
}

enum Reply {
    Ok,
    Pong,
    Nil,
    Bulk(String),
    Int(i64),
    Array(Vec<String>),
    Error(String),
}

impl Reply {
    fn encode(&self) -> String {
        match self {
            Reply::Ok => "+OK\r\n".to_string(),
            Reply::Pong => "+PONG\r\n".to_string(),
            Reply::Nil => "$-1\r\n".to_string(),
            Reply::Bulk(value) => bulk(value),
            Reply::Int(n) => format!(":{n}\r\n"),
            Reply::Array(items) => {
                let mut out = format!("*{}\r\n", items.len());
                for item in items {
                    out.push_str(&bulk(item));
                }
                out
            }
            Reply::Error(msg) => format!("-ERR {msg}\r\n"),
        }
    }
}

fn bulk(value: &str) -> String {
    format!("${}\r\n{value}\r\n", value.len())
}

impl Data {
    fn with<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut state)
    }

    fn move_head(&self, src: &str, dst: &str) -> Option<String> {
        self.with(|state| {
            let value = state.lists.get_mut(src)?.pop_front()?;
            state
                .lists
                .entry(dst.to_string())
                .or_default()
                .push_back(value.clone());
            Some(value)
        })
    }
}

impl FakeRedis {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake redis");
        let addr = listener.local_addr().expect("fake redis address");
        let data = Data::default();

        let accept_data = data.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, accept_data.clone()));
            }
        });

        Self { addr, data }
    }

    pub fn url(&self) -> String {
        format!("redis://{}/", self.addr)
    }

    /// Upper-cased names of every command received so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.data.with(|state| state.commands.clone())
    }

    pub fn list(&self, name: &str) -> Vec<String> {
        self.data.with(|state| {
            state
                .lists
                .get(name)
                .map(|items| items.iter().cloned().collect())
                .unwrap_or_default()
        })
    }

    pub fn string(&self, key: &str) -> Option<String> {
        self.data.with(|state| state.strings.get(key).cloned())
    }
}

async fn serve(stream: TcpStream, data: Data) {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);

    while let Ok(Some(args)) = read_command(&mut reader).await {
        let reply = execute(&data, &args).await;
        if write.write_all(reply.encode().as_bytes()).await.is_err() {
            break;
        }
    }
}

async fn read_command(reader: &mut BufReader<OwnedReadHalf>) -> io::Result<Option<Vec<String>>> {
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    let count = header(&line, '*')?;

    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        line.clear();
        reader.read_line(&mut line).await?;
        let len = header(&line, '$')?;
        let mut buf = vec![0; len + 2];
        reader.read_exact(&mut buf).await?;
        buf.truncate(len);
        args.push(String::from_utf8_lossy(&buf).into_owned());
    }
    Ok(Some(args))
}

fn header(line: &str, prefix: char) -> io::Result<usize> {
    line.trim_end()
        .strip_prefix(prefix)
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, format!("bad header {line:?}")))
}

async fn execute(data: &Data, args: &[String]) -> Reply {
    let Some(name) = args.first().map(|n| n.to_uppercase()) else {
        return Reply::Error("empty command".to_string());
    };
    data.with(|state| state.commands.push(name.clone()));
    let arg = |i: usize| args.get(i).cloned().unwrap_or_default();

    match name.as_str() {
        "CLIENT" | "SELECT" => Reply::Ok,
        "PING" => Reply::Pong,
        "GET" => match data.with(|state| state.strings.get(&arg(1)).cloned()) {
            Some(value) => Reply::Bulk(value),
            None => Reply::Nil,
        },
        "SET" => {
            data.with(|state| state.strings.insert(arg(1), arg(2)));
            Reply::Ok
        }
        "RPUSH" => {
            let len = data.with(|state| {
                let list = state.lists.entry(arg(1)).or_default();
                list.extend(args[2..].iter().cloned());
                list.len()
            });
            Reply::Int(len as i64)
        }
        "LMOVE" => match data.move_head(&arg(1), &arg(2)) {
            Some(value) => Reply::Bulk(value),
            None => Reply::Nil,
        },
        "BLMOVE" => {
            let block = arg(5).parse::<f64>().unwrap_or(0.0);
            let deadline = Instant::now() + Duration::from_secs_f64(block);
            loop {
                if let Some(value) = data.move_head(&arg(1), &arg(2)) {
                    break Reply::Bulk(value);
                }
                if Instant::now() >= deadline {
                    break Reply::Nil;
                }
                sleep(Duration::from_millis(5)).await;
            }
        }
        "LREM" => {
            let removed = data.with(|state| {
                let Some(list) = state.lists.get_mut(&arg(1)) else {
                    return 0;
                };
                let value = arg(3);
                let before = list.len();
                list.retain(|item| *item != value);
                before - list.len()
            });
            Reply::Int(removed as i64)
        }
        "LRANGE" => {
            let items = data.with(|state| {
                state
                    .lists
                    .get(&arg(1))
                    .map(|items| items.iter().cloned().collect())
                    .unwrap_or_default()
            });
            Reply::Array(items)
        }
        "LLEN" => {
            let len = data.with(|state| state.lists.get(&arg(1)).map_or(0, VecDeque::len));
            Reply::Int(len as i64)
        }
        other => Reply::Error(format!("unknown command '{other}'")),
    }
}
