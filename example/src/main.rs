use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tandem::{Connection, Listener, LoggingHook, LogPriority, ParameterSettings};
use tandem_codec::TypedConnection;

fn main() {
  // LOGGING HOOK
  //
  // Prints everything at info and above; flip the bound to Debug to watch
  // the whole protocol.
  let hook: LoggingHook = Arc::new(|module, action, event, priority| {
    if u8::from(priority) <= u8::from(LogPriority::Info) {
      println!("[{module}] [{action}] {event}");
    }
  });

  let settings: ParameterSettings = ParameterSettings::default();

  // SERVER
  let listener: Listener = Listener::new(0, settings, hook.clone()).unwrap();
  let port: u16 = listener.port();
  let server: thread::JoinHandle<()> = thread::spawn(move || {
    let mut connection: Connection = listener.accept().unwrap();
    let (name, number): (String, i64) = connection
      .receive_values(Duration::from_secs(5))
      .unwrap()
      .unwrap();
    println!("server received: {name} {number}");
    connection.send_values(&(format!("{name}-ack"), number * 2)).unwrap();
    // Let the heartbeat take a few measurements before hanging up.
    thread::sleep(settings.loop_period * 5);
    println!("server ping: {} ms", connection.ping());
    connection.stop();
    listener.close_listener();
  });

  // CLIENT
  let mut connection: Connection = Connection::connect("127.0.0.1", port, settings, hook).unwrap();
  connection.send_values(&("hello".to_string(), 21i64)).unwrap();
  let (answer, doubled): (String, i64) = connection
    .receive_values(Duration::from_secs(5))
    .unwrap()
    .unwrap();
  println!("client received: {answer} {doubled}");
  println!("client ping: {} ms", connection.ping());

  server.join().unwrap();
  connection.stop();
}
