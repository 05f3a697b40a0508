//! Reads lines from stdin on a background thread and relays them to a looper
//! running on the main thread.
//!
//! Try: `cargo run --example console_relay`, type a few lines, then `quit`.
//! `later <text>` is delivered after two seconds, `cancel` drops pending
//! delayed lines.

use std::io::{self, BufRead};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use herald::logging::{self, LogConfig};
use herald::{payload, Dispatcher, Looper, Message};

const MSG_LINE: i32 = 1;
const MSG_DELAYED: i32 = 2;
const MSG_QUIT: i32 = 3;

fn main() -> Result<()> {
    logging::init(LogConfig::development())?;

    let looper = Looper::prepare()?;
    let quitter = looper.clone();
    let dispatcher = Dispatcher::with_handler(move |msg: &Message| match msg.what {
        MSG_LINE | MSG_DELAYED => {
            let line = msg.payload::<String>().map(String::as_str).unwrap_or("");
            let tag = if msg.what == MSG_DELAYED { "later" } else { "now" };
            println!("[{:?}] {tag}: {line}", thread::current().name());
        }
        MSG_QUIT => {
            println!("bye");
            if let Err(err) = quitter.quit() {
                eprintln!("quit failed: {err}");
            }
        }
        _ => {}
    })?;

    let reader = {
        let dispatcher = dispatcher.clone();
        thread::Builder::new()
            .name("stdin-reader".to_string())
            .spawn(move || -> Result<()> {
                for line in io::stdin().lock().lines() {
                    let line = line?;
                    let sent = match line.trim() {
                        "quit" => dispatcher.send_empty_message(MSG_QUIT),
                        "cancel" => {
                            dispatcher.remove_messages(MSG_DELAYED);
                            true
                        }
                        text => match text.strip_prefix("later ") {
                            Some(rest) => {
                                let msg = dispatcher.obtain_message_with(
                                    MSG_DELAYED,
                                    0,
                                    0,
                                    Some(payload(rest.to_string())),
                                )?;
                                dispatcher.send_message_delayed(msg, Duration::from_secs(2))
                            }
                            None => {
                                let msg = dispatcher.obtain_message_with(
                                    MSG_LINE,
                                    0,
                                    0,
                                    Some(payload(text.to_string())),
                                )?;
                                dispatcher.send_message(msg)
                            }
                        },
                    };
                    if !sent {
                        break;
                    }
                }
                Ok(())
            })?
    };

    looper.run()?;
    println!("looper stopped: {:?}", looper.stats());

    // The reader may still be blocked on stdin; only report if it already ended.
    if reader.is_finished() {
        if let Ok(Err(err)) = reader.join() {
            eprintln!("reader failed: {err}");
        }
    }
    Ok(())
}
