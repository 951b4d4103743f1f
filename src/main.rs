fn main() -> anyhow::Result<()> {
    fabbench::cmdline()
}
