fn main() -> Result<(), Box<dyn std::error::Error>> {
    mcp_search::cli::main()
}
