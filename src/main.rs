//! Demo driver: recover whatever state the data directory holds, run a small
//! session against it and dump the result.

use basalt::{Config, Server};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let server = Server::new(Config::default())?;
    server.recover()?;

    let mut conn = server.start_connection();
    let _ = conn.query("CREATE DATABASE hello");
    let _ = conn.query(
        "CREATE TABLE hello.world(id int AUTO_INCREMENT, message varchar(10), PRIMARY KEY(id))",
    );
    let _ = conn.query("INSERT INTO hello.world(message) VALUES ('foo'), ('bar')");
    let _ = conn.query("INSERT INTO hello.world(message) VALUES ('baz')");

    let res = conn.query("SELECT * FROM hello.world")?;
    print!("{}", res.inspect());

    conn.query("UPDATE hello.world SET message = 'bar bar' WHERE id = 2")?;
    let res = conn.query("SELECT * FROM hello.world")?;
    print!("{}", res.inspect());

    let res = conn.query("SELECT message FROM hello.world")?;
    print!("{}", res.inspect());
    let res = conn.query("SELECT message FROM hello.world WHERE id = 1")?;
    print!("{}", res.inspect());

    print!("{}", server.inspect());
    Ok(())
}
