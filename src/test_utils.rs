//! Helpers shared by the tests.

/// Skip the current test when a program isn't installed.
macro_rules! require_program {
    ($name:expr) => {{
        let exists = ::std::process::Command::new($name)
            .arg("--help")
            .stdout(::std::process::Stdio::null())
            .stderr(::std::process::Stdio::null())
            .status()
            .is_ok();
        if !exists {
            eprintln!("Couldn't find \"{}\"", $name);
            return;
        }
    }};
}
