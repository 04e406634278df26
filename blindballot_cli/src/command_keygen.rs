use blindballot::{biguint_to_hex, AuditSigner, AuthorityConfig};

pub fn command_keygen(matches: &clap::ArgMatches) {
    let bits: usize = match matches.value_of("bits").unwrap_or("2048").parse() {
        Ok(bits) => bits,
        Err(e) => {
            eprintln!("blindballot keygen: invalid key size: {}", e);
            std::process::exit(1);
        }
    };

    let authority = AuthorityConfig::generate(bits).unwrap_or_else(|e| {
        eprintln!("blindballot keygen: {}", e);
        std::process::exit(1);
    });

    println!("BLINDBALLOT_RSA_MODULUS_HEX={}", biguint_to_hex(&authority.n));
    println!("BLINDBALLOT_RSA_PUBLIC_EXPONENT_HEX={}", biguint_to_hex(&authority.e));
    println!("BLINDBALLOT_RSA_PRIVATE_EXPONENT_HEX={}", authority.private_exponent_hex());

    if matches.is_present("audit") {
        let signer = AuditSigner::generate();

        println!("audit-key-id: {}", signer.key_id());
        println!("audit-secret-key: {}", hex::encode(signer.signing_key().to_bytes()));
        println!("audit-public-key: {}", signer.public_key_hex());
    }
}
