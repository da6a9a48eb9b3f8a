use cyris_range_control::cli;

fn main() {
    std::process::exit(cli::run());
}
