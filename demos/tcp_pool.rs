//! TCP connection pool example.
//!
//! This example starts a small line-echo server on a local port, leases
//! pooled connections against it from several threads, and prints the
//! pool statistics at the end.
//!
//! Run: cargo run --example tcp_pool

use leasepool::transport::TcpConnector;
use leasepool::{ConnectionConfig, ConnectionPool, PoolConfig, PoolError};
use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::thread;
use std::time::Duration;

const WORKERS: usize = 4;
const REQUESTS_PER_WORKER: usize = 5;

fn spawn_echo_server() -> std::io::Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?.to_string();

    thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            thread::spawn(move || {
                let Ok(mut writer) = stream.try_clone() else {
                    return;
                };
                for line in BufReader::new(stream).lines().map_while(Result::ok) {
                    if writeln!(writer, "{line}").is_err() {
                        break;
                    }
                }
            });
        }
    });

    Ok(addr)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let addr = spawn_echo_server()?;
    println!("Echo server listening on {addr}");

    let config = PoolConfig::new(addr)
        .with_max_connections(2)
        .with_idle_timeout(Duration::from_secs(30))
        .with_sweep_interval(Duration::from_secs(5));
    let connector = TcpConnector::new(
        ConnectionConfig::default().with_read_timeout(Duration::from_secs(2)),
    );
    let pool = ConnectionPool::new(config, connector);

    let workers: Vec<_> = (0..WORKERS)
        .map(|worker| {
            let pool = pool.clone();
            thread::spawn(move || {
                for request in 0..REQUESTS_PER_WORKER {
                    let mut conn = match pool.lease() {
                        Ok(conn) => conn,
                        Err(PoolError::CapacityExceeded { .. }) => {
                            println!("worker {worker}: pool busy, backing off");
                            thread::sleep(Duration::from_millis(20));
                            continue;
                        }
                        Err(e) => {
                            eprintln!("worker {worker}: lease failed: {e}");
                            return;
                        }
                    };

                    let mut reply = String::new();
                    let echoed = writeln!(conn, "worker {worker} request {request}")
                        .and_then(|()| {
                            let mut reader = BufReader::new(conn.get_ref());
                            reader.read_line(&mut reply)
                        });

                    match echoed {
                        Ok(_) => {
                            print!("worker {worker}: {reply}");
                            if let Err(e) = pool.put(conn) {
                                eprintln!("worker {worker}: return failed: {e}");
                            }
                        }
                        Err(e) => {
                            eprintln!("worker {worker}: transport error: {e}");
                            let _ = pool.report_broken(conn);
                        }
                    }
                }
            })
        })
        .collect();

    for worker in workers {
        let _ = worker.join();
    }

    println!(
        "\nlive={} idle={} stats={:?}",
        pool.live_count(),
        pool.idle_count(),
        pool.stats()
    );

    pool.shutdown();
    println!("Pool shut down, idle={}", pool.idle_count());
    Ok(())
}
