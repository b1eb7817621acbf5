use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use crate::error::{Error, Result};

/// Writes the row names of a Paraver trace.
pub fn write_row_to<W: Write>(mut w: W, names: &[String]) -> io::Result<()> {
    writeln!(w, "LEVEL NODE SIZE 1")?;
    writeln!(w, "hostname")?;
    writeln!(w)?;
    writeln!(w, "LEVEL THREAD SIZE {}", names.len())?;
    for name in names {
        writeln!(w, "{}", name)?;
    }
    Ok(())
}

pub fn write_row<P: AsRef<Path>>(path: P, names: &[String]) -> Result<()> {
    let path = path.as_ref();
    println!("Writing {:?}", path);
    let file = File::create(path).map_err(|e| Error::io(path, e))?;
    let mut w = BufWriter::new(file);
    write_row_to(&mut w, names).map_err(|e| Error::io(path, e))?;
    w.flush().map_err(|e| Error::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row() {
        let mut out = Vec::new();
        write_row_to(&mut out, &["a".to_owned(), "b".to_owned()]).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "LEVEL NODE SIZE 1\nhostname\n\nLEVEL THREAD SIZE 2\na\nb\n"
        );
    }
}
