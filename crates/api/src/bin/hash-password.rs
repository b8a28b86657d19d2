//! Worker provisioning helper
//!
//! Hashes a password with Argon2id and prints the SQL that inserts a worker
//! row, so accounts can be created without the server ever seeing plaintext.
//!
//! Usage:
//!   hash-password <username> [display name]
//!
//! The password is read from stdin.

use std::env;
use std::io::{self, Write};

use deskline_api::auth::hash_password;
use uuid::Uuid;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = env::args().skip(1);
    let Some(username) = args.next() else {
        eprintln!("Usage: hash-password <username> [display name]");
        std::process::exit(2);
    };
    let display_name = args.next().unwrap_or_else(|| username.clone());

    print!("Password for {}: ", username);
    io::stdout().flush()?;
    let mut password = String::new();
    io::stdin().read_line(&mut password)?;
    let password = password.trim_end_matches(['\r', '\n']);

    if password.is_empty() {
        eprintln!("Error: Password cannot be empty");
        std::process::exit(1);
    }
    if password.len() < 12 {
        eprintln!("Warning: Password is less than 12 characters. Consider using a longer password.");
    }

    let password_hash = hash_password(password)?;

    println!("\n{}\n", password_hash);
    println!(
        "INSERT INTO workers (id, username, display_name, password_hash) VALUES ('{}', '{}', '{}', '{}');",
        Uuid::new_v4(),
        username.replace('\'', "''"),
        display_name.replace('\'', "''"),
        password_hash
    );

    Ok(())
}
