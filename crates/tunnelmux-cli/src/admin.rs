//! `admin create`/`admin update`: persist a username/password into the
//! panel's settings. Authentication itself (login, sessions) is explicitly
//! out of scope for this system, so this is bookkeeping only — no login
//! flow ever checks `password_hash`. The hash here exists purely so a
//! plaintext password isn't the thing written to `Settings`; it is not a
//! substitute for real password hashing and must not be treated as one.

use std::io::Write;

use tunnelmux_core::model::{AdminCredentials, Settings};

use crate::config::CliConfig;

fn placeholder_hash(password: &str) -> String {
  const FNV_OFFSET: u64 = 0xcbf29ce484222325;
  const FNV_PRIME: u64 = 0x100000001b3;
  let mut hash = FNV_OFFSET;
  for byte in password.as_bytes() {
    hash ^= *byte as u64;
    hash = hash.wrapping_mul(FNV_PRIME);
  }
  format!("{hash:016x}")
}

fn prompt(label: &str) -> anyhow::Result<String> {
  print!("{label}: ");
  std::io::stdout().flush()?;
  let mut line = String::new();
  std::io::stdin().read_line(&mut line)?;
  Ok(line.trim().to_string())
}

/// No dedicated password-prompt crate is attested in the pack for this
/// out-of-scope concern; read from stdin without echo suppression rather
/// than pull one in for a single non-security-critical prompt.
fn prompt_password(label: &str) -> anyhow::Result<String> {
  prompt(label)
}

fn fetch_settings(client: &reqwest::blocking::Client, base_url: &str) -> anyhow::Result<Settings> {
  Ok(client.get(format!("{base_url}/panel/settings")).send()?.error_for_status()?.json()?)
}

fn put_settings(client: &reqwest::blocking::Client, base_url: &str, settings: &Settings) -> anyhow::Result<()> {
  client
    .put(format!("{base_url}/panel/settings"))
    .json(settings)
    .send()?
    .error_for_status()?;
  Ok(())
}

pub fn create(config: &CliConfig, username: Option<String>, password: Option<String>) -> anyhow::Result<()> {
  let client = reqwest::blocking::Client::new();
  let mut settings = fetch_settings(&client, &config.panel_base_url)?;
  if settings.admin.is_some() {
    anyhow::bail!("an admin already exists; use `tunnelmux admin update` instead");
  }

  let username = match username {
    Some(u) => u,
    None => prompt("Username")?,
  };
  let password = match password {
    Some(p) => p,
    None => loop {
      let p1 = prompt_password("Password")?;
      let p2 = prompt_password("Confirm password")?;
      if p1 == p2 {
        break p1;
      }
      println!("Passwords do not match, try again.");
    },
  };

  settings.admin = Some(AdminCredentials {
    username,
    password_hash: placeholder_hash(&password),
  });
  put_settings(&client, &config.panel_base_url, &settings)?;
  println!("Admin created.");
  Ok(())
}

pub fn update(config: &CliConfig, password: Option<String>) -> anyhow::Result<()> {
  let client = reqwest::blocking::Client::new();
  let mut settings = fetch_settings(&client, &config.panel_base_url)?;
  let Some(mut admin) = settings.admin.clone() else {
    anyhow::bail!("no admin exists yet; use `tunnelmux admin create` first");
  };

  let password = match password {
    Some(p) => p,
    None => prompt_password("New password")?,
  };
  admin.password_hash = placeholder_hash(&password);
  settings.admin = Some(admin);
  put_settings(&client, &config.panel_base_url, &settings)?;
  println!("Admin password updated.");
  Ok(())
}
