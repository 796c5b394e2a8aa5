/// This file contains the model listers - no cluster interaction
use super::{ObjectSet, Result};

/// Print identity and origin for every loaded object
pub fn models(set: &ObjectSet) -> Result<()> {
    for obj in set.sorted() {
        println!("{:<60} {}", obj.identity().to_string(), obj.origin());
    }
    Ok(())
}
