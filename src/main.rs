//! SHALE - Single-File B+Tree Key-Value Storage Engine
//! Interactive shell over a database file.

use std::io::{self, BufRead, Write};

use shale::config::Config;
use shale::store::Store;

fn print_help() {
    println!("  Commands:");
    println!("    mkbucket <bucket>              - Create a bucket");
    println!("    rmbucket <bucket>              - Delete a bucket and its contents");
    println!("    buckets                        - List buckets");
    println!("    put <bucket> <key> <value>     - Store a key-value pair");
    println!("    get <bucket> <key>             - Retrieve a value by key");
    println!("    del <bucket> <key>             - Delete a key");
    println!("    scan <bucket> [limit] [offset] - List pairs in key order");
    println!("    select <bucket> [limit] [offset] - List pairs newest key first");
    println!("    count <bucket>                 - Count pairs in a bucket");
    println!("    seq <counter>                  - Advance a sequence counter");
    println!("    stats                          - Show database statistics");
    println!("    readers                        - Show open read transactions");
    println!("    metrics                        - Show engine metrics");
    println!("    exit                           - Close the database");
    println!();
}

fn number(arg: Option<&&str>) -> usize {
    arg.and_then(|s| s.parse().ok()).unwrap_or(0)
}

fn show(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => format!("\"{}\"", s),
        Err(_) => format!("<{} bytes>", bytes.len()),
    }
}

fn main() {
    env_logger::init();

    println!();
    println!("  ╔═══════════════════════════════════════════╗");
    println!("  ║            SHALE Storage Engine           ║");
    println!("  ║    Copy-on-Write B+Tree Key-Value Store   ║");
    println!("  ╚═══════════════════════════════════════════╝");
    println!();
    print_help();

    let config = match std::env::args().nth(1) {
        Some(path) => Config::new(path),
        None => Config::default(),
    };
    let store = match Store::open(config, &[]) {
        Ok(s) => s,
        Err(err) => {
            eprintln!("[ERROR] Failed to open database: {}", err);
            std::process::exit(1);
        }
    };

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("shale> ");
        if stdout.flush().is_err() {
            break;
        }

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => break, // EOF
            Ok(_) => {}
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.is_empty() {
            continue;
        }

        let result = match (parts[0].to_lowercase().as_str(), &parts[1..]) {
            ("mkbucket", [bucket, ..]) => store.ensure_buckets(&[*bucket]).map(|()| {
                println!("  OK");
            }),
            ("rmbucket", [bucket, ..]) => store
                .db()
                .update(|tx| tx.delete_bucket(bucket.as_bytes()))
                .map(|existed| {
                    println!("  {}", if existed { "OK (deleted)" } else { "(no such bucket)" });
                }),
            ("buckets", _) => store.db().view(|tx| tx.buckets()).map(|names| {
                for name in &names {
                    println!("  {}", String::from_utf8_lossy(name));
                }
                println!("  ({} buckets)", names.len());
            }),
            ("put" | "set", [bucket, key, value @ ..]) if !value.is_empty() => store
                .add(bucket, key.as_bytes(), value.join(" ").as_bytes())
                .map(|()| println!("  OK")),
            ("get", [bucket, key, ..]) => store.get(bucket, key.as_bytes()).map(|v| match v {
                Some(value) => println!("  {}", show(&value)),
                None => println!("  (nil)"),
            }),
            ("del" | "delete", [bucket, key, ..]) => {
                store.delete(bucket, key.as_bytes()).map(|existed| {
                    println!("  {}", if existed { "OK (deleted)" } else { "(nil)" });
                })
            }
            ("scan", [bucket, rest @ ..]) => {
                let mut scan = shale::types::Scan::forward().offset(number(rest.get(1)));
                let limit = number(rest.first());
                if limit > 0 {
                    scan = scan.limit(limit);
                }
                store.db().view(|tx| {
                    let mut shown = 0;
                    for entry in tx.scan(bucket.as_bytes(), scan)? {
                        let (key, value) = entry?;
                        println!("  {} -> {}", String::from_utf8_lossy(&key), show(&value));
                        shown += 1;
                    }
                    println!("  ({} entries)", shown);
                    Ok(())
                })
            }
            ("select", [bucket, rest @ ..]) => {
                let mut shown = 0;
                store
                    .select(bucket, number(rest.first()), number(rest.get(1)), |k, v| {
                        println!("  {} -> {}", String::from_utf8_lossy(k), show(v));
                        shown += 1;
                    })
                    .map(|()| println!("  ({} entries)", shown))
            }
            ("count", [bucket, ..]) => store.count(bucket).map(|n| println!("  {}", n)),
            ("seq", [counter, ..]) => store.next(counter).map(|n| println!("  {}", n)),
            ("stats" | "info", _) => {
                let stats = store.db().stats();
                println!("  Page size:     {} bytes", stats.page_size);
                println!("  Transaction:   {}", stats.txid);
                println!("  High water:    {} pages", stats.high_water);
                println!("  Free pages:    {}", stats.free_pages);
                println!("  Pending pages: {}", stats.pending_pages);
                println!("  Open readers:  {}", stats.open_readers);
                println!("  File size:     {} bytes", stats.file_size);
                Ok(())
            }
            ("readers", _) => {
                let readers = store.db().active_readers();
                for r in &readers {
                    println!(
                        "  reader {} on snapshot {} ({:.1}s)",
                        r.id,
                        r.snapshot,
                        r.age.as_secs_f64()
                    );
                }
                println!("  ({} open)", readers.len());
                Ok(())
            }
            ("metrics", _) => {
                println!("{}", store.db().metrics().report());
                Ok(())
            }
            ("help", _) => {
                print_help();
                Ok(())
            }
            ("exit" | "quit" | "q", _) => {
                println!("  Shutting down SHALE...");
                break;
            }
            (cmd, _) => {
                println!("  Unknown or incomplete command: '{}'. Type 'help'.", cmd);
                Ok(())
            }
        };

        if let Err(e) = result {
            println!("  ERROR: {}", e);
        }
    }

    if let Err(e) = store.close() {
        eprintln!("[ERROR] Failed to close database: {}", e);
    }
}
