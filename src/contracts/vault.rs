use ethers::prelude::abigen;

abigen!(
    IVault,
    r#"[
        function balance() external view returns (uint256)
        function getPricePerFullShare() external view returns (uint256)
        function want() external view returns (address)
    ]"#
);
