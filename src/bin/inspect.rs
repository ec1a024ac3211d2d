use std::process::exit;

use clap::{App, Arg};

use classfile::PoolDisplay;

fn main() {
    pretty_env_logger::init();

    let app = App::new(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::with_name("class")
                .takes_value(true)
                .help("Class file to read [default: Main.class]"),
        )
        .arg(
            Arg::with_name("constants")
                .short("c")
                .long("constants")
                .help("Print only the constant pool as it appears in the class file"),
        )
        .get_matches();

    let path = app.value_of("class").unwrap_or("Main.class");
    let class = match classfile::open_class(path) {
        Ok(class) => class,
        Err(e) => {
            eprintln!("Failed to read {}: {}", path, e);
            exit(1);
        }
    };

    if app.is_present("constants") {
        println!("Constant Table:");
        let pool = class.constant_pool();
        for (index, constant) in pool.iter() {
            println!("\t{}/{}: {}", index, pool.count(), constant.display(pool));
        }
    } else {
        println!("{}", class);
    }
}
