//! Zip package fixtures for upload tests.

use std::io::{Cursor, Write};

use zip::write::SimpleFileOptions;

/// A minimal valid SKILL.md document.
pub fn skill_md(name: &str, description: &str) -> String {
    format!(
        "---\nname: {name}\ndescription: {description}\n---\n\n# {name}\n\nRepeat $ARGUMENTS back to the user.\n"
    )
}

/// Build an in-memory zip from (path, content) pairs.
pub fn make_zip(files: &[(&str, &str)]) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut buf);
        for (path, content) in files {
            writer
                .start_file(*path, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
    }
    buf.into_inner()
}

/// A single-skill package zip with one reference file.
pub fn make_skill_zip(name: &str, description: &str) -> Vec<u8> {
    make_zip(&[
        ("SKILL.md", &skill_md(name, description)),
        ("references/usage.md", "# Usage\n\nSee SKILL.md.\n"),
    ])
}
