//! stratum-probe: smoke-test a running proxy
//!
//! Connects, subscribes, authorizes and submits one share, printing every
//! response. Exits non-zero if the proxy does not answer in time.

use std::error::Error;
use std::time::Duration;

use clap::Parser;
use math_proxy::protocols::stratum::{Request, Response};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

#[derive(Parser, Debug)]
#[command(name = "stratum-probe")]
#[command(about = "Send subscribe, authorize and submit to a Stratum proxy", long_about = None)]
struct Args {
    /// Proxy address
    #[arg(short, long, default_value = "localhost:3333")]
    addr: String,

    /// Worker name used for authorize and submit
    #[arg(short, long, default_value = "test.worker")]
    worker: String,

    /// Seconds to wait for each response
    #[arg(short, long, default_value_t = 5)]
    timeout: u64,
}

struct Probe {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    timeout: Duration,
}

impl Probe {
    async fn call(&mut self, request: &Request) -> Result<Response, Box<dyn Error>> {
        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;

        let mut reply = String::new();
        let n = tokio::time::timeout(self.timeout, self.reader.read_line(&mut reply)).await??;
        if n == 0 {
            return Err("connection closed by proxy".into());
        }
        Ok(serde_json::from_str(&reply)?)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let stream = TcpStream::connect(&args.addr).await?;
    println!("Connected to {}", args.addr);

    let (reader, writer) = stream.into_split();
    let mut probe = Probe {
        reader: BufReader::new(reader),
        writer,
        timeout: Duration::from_secs(args.timeout),
    };

    let steps = [
        (
            "Subscribe",
            Request::new(1, "mining.subscribe", vec![json!("stratum-probe/1.0")]),
        ),
        (
            "Authorize",
            Request::new(
                2,
                "mining.authorize",
                vec![json!(args.worker), json!("password")],
            ),
        ),
        (
            "Submit",
            Request::new(
                3,
                "mining.submit",
                vec![
                    json!(args.worker),
                    json!("job123"),
                    json!("00000000"),
                    json!("507c0000"),
                    json!("00000000"),
                ],
            ),
        ),
    ];

    for (label, request) in &steps {
        let response = probe.call(request).await?;
        match response.error {
            Some(error) => println!(
                "{label} error: [{}] {} (id {:?})",
                error.code(),
                error.message(),
                response.id
            ),
            None => println!("{label} response: {} (id {:?})", response.result, response.id),
        }
    }

    Ok(())
}
