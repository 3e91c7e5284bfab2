use fibre_keyed_cache::{ObjectCallbacks, PersistentCacheBuilder};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
struct Account {
  owner: String,
  balance: i64,
}

fn main() {
  // Stands in for a database table.
  let table: Arc<Mutex<HashMap<u32, Account>>> = Arc::default();
  table.lock().unwrap().insert(
    1,
    Account {
      owner: "ada".to_string(),
      balance: 100,
    },
  );

  let load_table = table.clone();
  let save_table = table.clone();
  let callbacks = ObjectCallbacks::new()
    .load(move |id: &u32| Ok(load_table.lock().unwrap().get(id).cloned()))
    .create(|id: &u32| {
      Ok(Account {
        owner: format!("user-{id}"),
        balance: 0,
      })
    })
    .save(move |id: &u32, account: &Account| {
      println!("  saving account {id}: {account:?}");
      save_table.lock().unwrap().insert(*id, account.clone());
      Ok(true)
    });

  let cache = PersistentCacheBuilder::default()
    .default_callbacks(callbacks)
    .save_interval(Duration::from_millis(200))
    .build()
    .expect("Failed to build cache");

  println!("Depositing into account 1 (loaded) and account 2 (created).");
  cache.update(&1, |account| account.balance += 50).expect("update");
  cache.update(&2, |account| account.balance += 10).expect("update");
  println!("Dirty keys: {}", cache.dirty_len());

  std::thread::sleep(Duration::from_millis(500));
  println!("Dirty keys after the saver ran: {}", cache.dirty_len());

  let report = cache.shutdown();
  println!("\nShutdown report: {report:?}");
  println!("Table: {:#?}", table.lock().unwrap());
}
