fn main() {
    parley_lib::run();
}
