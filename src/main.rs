fn main() {
    detect_relay::run_cli();
}
